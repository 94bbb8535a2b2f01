//! Event-triggered runs: an ingest and an analytics pass over HTTP.

use super::AppState;
use crate::{errors::AppError, services::analytics::AnalyticsReport, services::pipeline::IngestReport};
use axum::{Json, body::Bytes, extract::State};

/// POST `/ingest`: one sync of every source. Always 200; failures are
/// reported per candidate in the body.
pub async fn trigger_ingest(State(state): State<AppState>) -> Json<IngestReport> {
    Json(state.pipeline.ingest().await)
}

/// POST `/analytics`: the request body (typically a store notification) is
/// accepted but not interpreted.
pub async fn trigger_analytics(
    State(state): State<AppState>,
    _event: Bytes,
) -> Result<Json<AnalyticsReport>, AppError> {
    let report = state.pipeline.analytics().await?;
    Ok(Json(report))
}
