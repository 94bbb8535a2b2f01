//! The object-store capability shared by the sync engine, the table writer
//! and the analytics engine.
//!
//! Implementations must make `put` atomic per key: a reader observes either
//! the previous object or the new one, never a mix, and concurrent puts to the
//! same key resolve to the last completed write.

use crate::models::object::{Object, ObjectMeta, VersionMarker};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    /// Temporarily unreachable; callers retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("object `{key}` is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create or overwrite `key` atomically. `source_marker` is recorded as
    /// given; the content fingerprint is computed from `bytes`.
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        source_marker: VersionMarker,
    ) -> StoreResult<ObjectMeta>;

    /// Full object, payload included.
    async fn get(&self, key: &str) -> StoreResult<Object>;

    /// Metadata only; never reads the payload.
    async fn stat(&self, key: &str) -> StoreResult<ObjectMeta>;

    /// Keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Remove `key`. Returns `false` when there was nothing to remove.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Source marker recorded by the last put of `key`.
    async fn head(&self, key: &str) -> StoreResult<VersionMarker> {
        Ok(self.stat(key).await?.source_marker)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        match self.stat(key).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Store handle threaded explicitly through the pipeline.
pub type SharedStore = Arc<dyn ObjectStore>;

/// Basic key validation to avoid trivial path traversal vectors.
///
/// Rejects empty or over-long keys, keys that begin with `/`, contain `..`,
/// backslashes or control characters.
pub fn validate_key(key: &str) -> StoreResult<()> {
    let invalid = key.is_empty()
        || key.len() > MAX_OBJECT_KEY_LEN
        || key.starts_with('/')
        || key.contains("..")
        || key.bytes().any(|b| b.is_ascii_control() || b == b'\\');
    if invalid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsafe_keys() {
        assert!(validate_key("bls/pr.data.0.Current").is_ok());
        assert!(validate_key("population/raw/population.json.table").is_ok());
        for bad in ["", "/etc/passwd", "bls/../secret", "a\\b", "tab\tkey"] {
            assert!(
                matches!(validate_key(bad), Err(StoreError::InvalidKey(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_key(&"k".repeat(MAX_OBJECT_KEY_LEN + 1)).is_err());
    }
}
