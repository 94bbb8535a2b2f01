//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness ("ok")
//! - GET /readyz   -> readiness; metadata round-trips against the store, no writes

use super::AppState;
use crate::services::object_store::{ObjectStore, StoreError};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// Never written; both checks only need the store to answer.
const PROBE_KEY: &str = ".readyz/probe";
const PROBE_PREFIX: &str = ".readyz/";

/// `GET /healthz`
///
/// Never touches the store.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 1. Lists a reserved prefix.
/// 2. Stats a reserved key; `NotFound` counts as an answer.
///
/// HTTP 200 when both checks pass, 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let list_check = match state.store.list(PROBE_PREFIX).await {
        Ok(_) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(format!("could not list: {}", e)),
    };

    let stat_check = match state.store.stat(PROBE_KEY).await {
        Ok(_) | Err(StoreError::NotFound(_)) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(format!("could not stat: {}", e)),
    };

    let overall_ok = list_check.ok && stat_check.ok;
    let mut checks = HashMap::new();
    checks.insert("store_list", list_check);
    checks.insert("store_stat", stat_check);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
