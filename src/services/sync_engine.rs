//! Sync engine: mirrors one remote source into the object store.
//!
//! For every candidate the stored source marker (metadata only) is compared
//! with the remote one; equal markers mean no fetch and no write, which makes
//! a re-run without remote changes a no-op. Candidates are independent: they
//! run concurrently and a failure is recorded against that candidate only.
//!
//! Once a listing succeeds, objects under the source's prefix that the remote
//! no longer lists are deleted together with their tables.

use crate::{
    models::{
        object::{ObjectMeta, VersionMarker},
        sync::{Candidate, CandidateReport, FailureReason, Outcome, SyncReport},
    },
    services::{
        object_store::{ObjectStore, SharedStore, StoreError},
        retry::RetryPolicy,
        sources::{RemoteSource, SourceError},
        table_writer::{TABLE_SUFFIX, TableFormat, TableWriter},
    },
};
use bytes::Bytes;
use futures::{StreamExt, future::join_all, stream};
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// One source plus where (and how) its candidates are stored.
#[derive(Clone)]
pub struct SourceDescriptor {
    pub source: Arc<dyn RemoteSource>,
    /// Raw objects land at `target_prefix + remote_id`.
    pub target_prefix: String,
    /// Structured copy to maintain for each raw object, if any.
    pub table: Option<TableFormat>,
}

impl SourceDescriptor {
    pub fn new(source: Arc<dyn RemoteSource>, target_prefix: impl Into<String>) -> Self {
        Self {
            source,
            target_prefix: target_prefix.into(),
            table: None,
        }
    }

    pub fn with_table(mut self, format: TableFormat) -> Self {
        self.table = Some(format);
        self
    }

    pub fn target_key(&self, remote_id: &str) -> String {
        format!("{}{}", self.target_prefix, remote_id)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    /// Upper bound for a single fetch attempt.
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
    /// Candidates of one source processed at the same time.
    pub concurrency: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            concurrency: 4,
        }
    }
}

#[derive(Debug)]
enum FetchError {
    Timeout,
    Source(SourceError),
}

impl FetchError {
    /// Timeouts are final: a remote that stalled once is not given the
    /// whole retry budget to stall again.
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout => false,
            FetchError::Source(err) => err.is_retryable(),
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Timeout => f.write_str("timed out"),
            FetchError::Source(err) => err.fmt(f),
        }
    }
}

impl From<FetchError> for FailureReason {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout => FailureReason::Timeout,
            FetchError::Source(err) => FailureReason::Fetch(err.to_string()),
        }
    }
}

pub struct SyncEngine {
    store: SharedStore,
    tables: TableWriter,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(store: SharedStore, settings: SyncSettings) -> Self {
        let tables = TableWriter::new(store.clone(), settings.retry);
        Self {
            store,
            tables,
            settings,
        }
    }

    /// Sync every descriptor. Sources are independent and run concurrently;
    /// reports come back in descriptor order.
    pub async fn run_all(&self, descriptors: &[SourceDescriptor]) -> Vec<SyncReport> {
        join_all(descriptors.iter().map(|d| self.run(d))).await
    }

    /// Sync all candidates of one source. Never fails as a whole: listing
    /// failures and per-candidate failures are reported.
    #[instrument(skip_all, fields(source = descriptor.source.name()))]
    pub async fn run(&self, descriptor: &SourceDescriptor) -> SyncReport {
        let source = descriptor.source.as_ref();
        let timeout = self.settings.fetch_timeout;
        let listing = self
            .settings
            .retry
            .run(
                "listing candidates",
                move || list_once(source, timeout),
                FetchError::is_retryable,
            )
            .await;
        let candidates = match listing {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, "listing failed");
                return SyncReport::listing_failed(source.name(), err.to_string());
            }
        };

        let listed: HashSet<String> = candidates
            .iter()
            .map(|c| descriptor.target_key(&c.remote_id))
            .collect();
        let mut reports: Vec<CandidateReport> = stream::iter(candidates)
            .map(|candidate| self.sync_candidate(descriptor, candidate))
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await;

        if listed.is_empty() {
            warn!("remote listed no candidates, keeping mirrored objects");
        } else {
            reports.extend(self.remove_unlisted(descriptor, &listed).await);
        }

        let report = SyncReport {
            source: source.name().to_string(),
            candidates: reports,
            listing_error: None,
        };
        info!(
            updated = report.updated(),
            unchanged = report.unchanged(),
            removed = report.removed(),
            failed = report.failed(),
            "sync finished"
        );
        report
    }

    async fn sync_candidate(
        &self,
        descriptor: &SourceDescriptor,
        candidate: Candidate,
    ) -> CandidateReport {
        let target_key = descriptor.target_key(&candidate.remote_id);
        let (outcome, fresh) = match self.sync_raw(descriptor, &candidate, &target_key).await {
            Ok(Some(bytes)) => (Outcome::Updated, Some(bytes)),
            Ok(None) => (Outcome::Unchanged, None),
            Err(reason) => {
                warn!(remote_id = %candidate.remote_id, %reason, "candidate failed");
                (Outcome::Failed(reason), None)
            }
        };

        // Structuring is a separate failure domain: the raw object stays synced.
        let table = match (&outcome, &descriptor.table) {
            (Outcome::Failed(_), _) | (_, None) => None,
            (_, Some(format)) => self.tables.refresh(&target_key, fresh.as_ref(), format).await,
        };

        CandidateReport {
            remote_id: candidate.remote_id,
            target_key,
            outcome,
            table,
        }
    }

    /// Returns the written bytes when the object was updated, `None` when its
    /// content was already current.
    async fn sync_raw(
        &self,
        descriptor: &SourceDescriptor,
        candidate: &Candidate,
        target_key: &str,
    ) -> Result<Option<Bytes>, FailureReason> {
        let stored = self
            .stored_meta(target_key)
            .await
            .map_err(|err| FailureReason::Store(err.to_string()))?;

        if let (Some(remote), Some(stored)) = (&candidate.version_marker, &stored) {
            if remote == &stored.source_marker {
                debug!(key = target_key, marker = %remote, "unchanged, skipping fetch");
                return Ok(None);
            }
        }

        let bytes = self.fetch(descriptor, &candidate.remote_id).await?;
        let content_version = VersionMarker::from_content(&bytes);
        // No cheap marker from the remote: the fingerprint stands in for it.
        let marker = candidate
            .version_marker
            .clone()
            .unwrap_or_else(|| content_version.clone());

        if let Some(stored) = &stored {
            if stored.content_version == content_version {
                if stored.source_marker != marker {
                    // Same payload under a new remote marker: only the marker moves.
                    self.put(target_key, bytes, marker.clone()).await?;
                    debug!(key = target_key, marker = %marker, "recorded new marker for identical content");
                } else {
                    debug!(key = target_key, "fetched content identical, skipping write");
                }
                return Ok(None);
            }
        }

        let meta = self.put(target_key, bytes.clone(), marker).await?;
        info!(key = target_key, marker = %meta.source_marker, size = meta.size_bytes, "updated");
        Ok(Some(bytes))
    }

    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        marker: VersionMarker,
    ) -> Result<ObjectMeta, FailureReason> {
        let store = self.store.as_ref();
        self.settings
            .retry
            .run(
                "put",
                move || store.put(key, bytes.clone(), marker.clone()),
                StoreError::is_transient,
            )
            .await
            .map_err(|err| FailureReason::Store(err.to_string()))
    }

    /// Delete raw objects under the descriptor's prefix whose keys are not in
    /// `listed`, plus their tables. One report per removed raw key.
    async fn remove_unlisted(
        &self,
        descriptor: &SourceDescriptor,
        listed: &HashSet<String>,
    ) -> Vec<CandidateReport> {
        let store = self.store.as_ref();
        let prefix = descriptor.target_prefix.as_str();
        let keys = match self
            .settings
            .retry
            .run("list", move || store.list(prefix), StoreError::is_transient)
            .await
        {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "cannot list mirrored objects, skipping removal");
                return Vec::new();
            }
        };

        let mut stale: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in keys {
            if listed.contains(&key) {
                continue;
            }
            let raw_key = key.strip_suffix(TABLE_SUFFIX).unwrap_or(key.as_str()).to_string();
            if raw_key != key && listed.contains(&raw_key) {
                continue;
            }
            stale.entry(raw_key).or_default().push(key);
        }

        let mut reports = Vec::with_capacity(stale.len());
        for (raw_key, keys) in stale {
            let outcome = match self.delete_all(&keys).await {
                Ok(()) => {
                    info!(key = %raw_key, "removed object no longer listed");
                    Outcome::Removed
                }
                Err(err) => {
                    warn!(key = %raw_key, error = %err, "removal failed");
                    Outcome::Failed(FailureReason::Store(err.to_string()))
                }
            };
            reports.push(CandidateReport {
                remote_id: raw_key.strip_prefix(prefix).unwrap_or(raw_key.as_str()).to_string(),
                target_key: raw_key,
                outcome,
                table: None,
            });
        }
        reports
    }

    async fn delete_all(&self, keys: &[String]) -> Result<(), StoreError> {
        let store = self.store.as_ref();
        for key in keys {
            let key = key.as_str();
            self.settings
                .retry
                .run("delete", move || store.delete(key), StoreError::is_transient)
                .await?;
        }
        Ok(())
    }

    /// Metadata only: the payload is never read to decide on a fetch.
    async fn stored_meta(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let store = self.store.as_ref();
        match self
            .settings
            .retry
            .run("stat", move || store.stat(key), StoreError::is_transient)
            .await
        {
            Ok(meta) => Ok(Some(meta)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn fetch(
        &self,
        descriptor: &SourceDescriptor,
        remote_id: &str,
    ) -> Result<Bytes, FailureReason> {
        let source = descriptor.source.as_ref();
        let timeout = self.settings.fetch_timeout;
        self.settings
            .retry
            .run(
                "fetch",
                move || fetch_once(source, remote_id, timeout),
                FetchError::is_retryable,
            )
            .await
            .map_err(FailureReason::from)
    }
}

async fn list_once(source: &dyn RemoteSource, timeout: Duration) -> Result<Vec<Candidate>, FetchError> {
    match tokio::time::timeout(timeout, source.list_candidates()).await {
        Ok(result) => result.map_err(FetchError::Source),
        Err(_) => Err(FetchError::Timeout),
    }
}

async fn fetch_once(
    source: &dyn RemoteSource,
    remote_id: &str,
    timeout: Duration,
) -> Result<Bytes, FetchError> {
    match tokio::time::timeout(timeout, source.fetch(remote_id)).await {
        Ok(result) => result.map_err(FetchError::Source),
        Err(_) => Err(FetchError::Timeout),
    }
}
