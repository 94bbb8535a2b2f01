//! Remote sources: anything that can enumerate candidates with a (possibly
//! absent) version marker and fetch one candidate's bytes.

use crate::models::sync::Candidate;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod api;
pub mod http;
pub mod listing;

pub use api::ApiSource;
pub use listing::ListingSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("unknown remote id `{0}`")]
    UnknownRemote(String),
    #[error("could not read listing at {url}: {reason}")]
    Listing { url: String, reason: String },
}

impl SourceError {
    /// Connection failures, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Request { .. } => true,
            SourceError::Status { status, .. } => *status >= 500 || *status == 429,
            SourceError::UnknownRemote(_) | SourceError::Listing { .. } => false,
        }
    }
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Short label used in reports and logs.
    fn name(&self) -> &str;

    async fn list_candidates(&self) -> Result<Vec<Candidate>, SourceError>;

    async fn fetch(&self, remote_id: &str) -> Result<Bytes, SourceError>;
}
