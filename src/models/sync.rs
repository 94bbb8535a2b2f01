//! Candidates considered by a sync run and the per-candidate report it emits.

use crate::models::object::VersionMarker;
use serde::Serialize;
use std::fmt;

/// One remote artifact considered for sync.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Identifier understood by the source's `fetch`.
    pub remote_id: String,

    /// Marker obtained without a full fetch, when the remote offers one.
    /// `None` means the engine must fetch and fingerprint the bytes.
    pub version_marker: Option<VersionMarker>,
}

impl Candidate {
    pub fn new(remote_id: impl Into<String>, version_marker: Option<VersionMarker>) -> Self {
        Self {
            remote_id: remote_id.into(),
            version_marker,
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Fetch(String),
    Store(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => f.write_str("timeout"),
            FailureReason::Fetch(msg) => write!(f, "fetch: {}", msg),
            FailureReason::Store(msg) => write!(f, "store: {}", msg),
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Unchanged,
    Updated,
    /// The remote no longer lists the artifact; its mirror was deleted.
    Removed,
    Failed(FailureReason),
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

/// Result of regenerating the structured copy of a raw object.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableOutcome {
    Written { key: String, rows: usize },
    Failed { key: String, error: String },
}

#[derive(Serialize, Clone, Debug)]
pub struct CandidateReport {
    pub remote_id: String,
    pub target_key: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<TableOutcome>,
}

/// Outcome summary for one source in one run.
#[derive(Serialize, Clone, Debug)]
pub struct SyncReport {
    pub source: String,
    pub candidates: Vec<CandidateReport>,
    /// Set when the candidate listing itself failed; no candidate was tried.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listing_error: Option<String>,
}

impl SyncReport {
    pub fn listing_failed(source: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            candidates: Vec::new(),
            listing_error: Some(error.into()),
        }
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.candidates.iter().map(|c| c.outcome.clone()).collect()
    }

    pub fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.candidates.iter().filter(|c| pred(&c.outcome)).count()
    }

    pub fn updated(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Updated))
    }

    pub fn unchanged(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Unchanged))
    }

    pub fn removed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Removed))
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::is_failed)
    }
}
