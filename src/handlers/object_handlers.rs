//! Read-only HTTP access to the object store.
//! Every write goes through the sync engine or the table writer.

use super::AppState;
use crate::{errors::AppError, models::object::ObjectMeta, services::object_store::ObjectStore};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::{Deserialize, Serialize};

const VERSION_MARKER_HEADER: &str = "x-version-marker";
const CONTENT_VERSION_HEADER: &str = "x-content-version";

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub prefix: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub prefix: String,
    pub keys: Vec<String>,
}

/// GET `/objects?prefix=`: keys under `prefix`, lexicographic.
pub async fn list_objects(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<ListResponse>, AppError> {
    let prefix = q.prefix.unwrap_or_default();
    let keys = state.store.list(&prefix).await?;
    Ok(Json(ListResponse { prefix, keys }))
}

/// GET `/objects/{*key}`: payload plus metadata headers.
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let object = state.store.get(&key).await?;
    let mut response = Response::new(Body::from(object.bytes));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &object.meta);
    Ok(response)
}

/// HEAD `/objects/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let meta = state.store.stat(&key).await?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &ObjectMeta) {
    let content_type = meta
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.size_bytes.max(0)),
    );

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    if let Ok(value) = HeaderValue::from_str(meta.source_marker.as_str()) {
        headers.insert(HeaderName::from_static(VERSION_MARKER_HEADER), value);
    }

    if let Ok(value) = HeaderValue::from_str(meta.content_version.as_str()) {
        headers.insert(HeaderName::from_static(CONTENT_VERSION_HEADER), value);
    }
}
