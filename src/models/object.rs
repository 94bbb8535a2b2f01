//! Represents an object (blob) stored under a key, plus the version markers
//! used to decide whether a remote artifact changed.
//!
//! An object carries two markers. `content_version` is derived from the
//! payload and moves only when the bytes do. `source_marker` is whatever the
//! writer recorded about where the bytes came from (a remote listing token,
//! or the raw version a table was built from) and can move on its own.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Cheap-to-compare token identifying one revision of an artifact.
///
/// Either supplied by the remote (listing timestamp and size, revision id) or
/// derived from the payload itself with [`VersionMarker::from_content`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct VersionMarker(String);

impl VersionMarker {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Fingerprint of the payload bytes (`sha256:<hex>`).
    pub fn from_content(bytes: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(Sha256::digest(bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata describing the current object stored under a key.
///
/// This is what `head`/`stat` return; it never carries the payload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObjectMeta {
    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Fingerprint of the stored payload.
    pub content_version: VersionMarker,

    /// Marker supplied by the writer on the last successful put.
    pub source_marker: VersionMarker,

    /// MD5 of the payload, hex encoded.
    pub etag: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Content type (MIME type), inferred from the key.
    pub content_type: Option<String>,

    /// Timestamp of the last successful put.
    pub last_modified: DateTime<Utc>,
}

/// A full object: metadata and payload, always read together.
#[derive(Clone, Debug)]
pub struct Object {
    pub meta: ObjectMeta,
    pub bytes: Bytes,
}

impl Object {
    /// Build an object for `bytes`, computing fingerprint, etag and size.
    pub fn new(key: &str, bytes: Bytes, source_marker: VersionMarker) -> Self {
        let meta = ObjectMeta {
            key: key.to_string(),
            content_version: VersionMarker::from_content(&bytes),
            source_marker,
            etag: etag_of(&bytes),
            size_bytes: bytes.len() as i64,
            content_type: Some(content_type_for(key).to_string()),
            last_modified: Utc::now(),
        };
        Self { meta, bytes }
    }
}

/// Hex MD5 of a payload, as stored in [`ObjectMeta::etag`].
pub fn etag_of(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Infer a content type from the key suffix.
pub fn content_type_for(key: &str) -> &'static str {
    if key.ends_with(".json") {
        "application/json"
    } else if key.ends_with(".table") || key.ends_with(".csv") {
        "text/csv"
    } else {
        "application/octet-stream"
    }
}
