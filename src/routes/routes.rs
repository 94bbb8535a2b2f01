//! Routes for the pipeline service.
//!
//! - `GET  /healthz`, `GET /readyz`: probes
//! - `GET  /objects?prefix=`: list keys
//! - `GET  /objects/{*key}`: download an object
//! - `HEAD /objects/{*key}`: metadata only
//! - `POST /ingest`: sync all sources once
//! - `POST /analytics`: run the analytics queries
//!
//! The wildcard `*key` allows nested keys like `bls/pr.data.0.Current.table`.

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
    object_handlers::{get_object, head_object, list_objects},
    trigger_handlers::{trigger_analytics, trigger_ingest},
};
use axum::{
    Router,
    routing::{get, post},
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/objects", get(list_objects))
        .route("/objects/{*key}", get(get_object).head(head_object))
        .route("/ingest", post(trigger_ingest))
        .route("/analytics", post(trigger_analytics))
}
