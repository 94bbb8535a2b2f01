//! Shared HTTP client setup for the remote sources.

use super::SourceError;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// `quest-pipeline/<version> (<contact>)`. The listing host rejects requests
/// without a contact address.
pub fn user_agent(contact_email: &str) -> String {
    format!(
        "quest-pipeline/{} ({})",
        env!("CARGO_PKG_VERSION"),
        contact_email
    )
}

/// Only connecting is bounded here; the sync engine owns the per-fetch
/// deadline so that an expiry is reported as a timeout.
pub fn build_client(contact_email: &str, connect_timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(user_agent(contact_email))
        .build()
}

/// GET `url` and return the body, mapping non-success statuses to errors.
pub async fn get_bytes(client: &Client, url: &str) -> Result<Bytes, SourceError> {
    debug!(url, "fetching");
    let request_err = |err: reqwest::Error| SourceError::Request {
        url: url.to_string(),
        message: err.to_string(),
    };
    let response = client.get(url).send().await.map_err(request_err)?;
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let body = response.bytes().await.map_err(request_err)?;
    debug!(url, bytes = body.len(), "fetched");
    Ok(body)
}
