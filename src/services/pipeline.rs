//! Wires the configured sources, the sync engine and the analytics engine
//! around one shared store.

use crate::{
    config::{AppConfig, POPULATION_FILE, StoreBackend},
    models::sync::SyncReport,
    services::{
        analytics::{AnalyticsEngine, AnalyticsError, AnalyticsReport},
        disk_store::DiskStore,
        memory_store::MemoryStore,
        object_store::SharedStore,
        sources::{ApiSource, ListingSource, http},
        sync_engine::{SourceDescriptor, SyncEngine},
        table_writer::TableFormat,
    },
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Open the store backend selected in `cfg`.
pub async fn open_store(cfg: &AppConfig) -> Result<SharedStore> {
    let store: SharedStore = match cfg.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Disk => Arc::new(
            DiskStore::open(&cfg.database_url, &cfg.storage_dir, &cfg.bucket)
                .await
                .with_context(|| format!("opening disk store at {}", cfg.storage_dir))?,
        ),
    };
    Ok(store)
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub sources: Vec<SyncReport>,
}

impl IngestReport {
    pub fn failed(&self) -> usize {
        self.sources
            .iter()
            .map(|s| s.failed() + usize::from(s.listing_error.is_some()))
            .sum()
    }
}

pub struct Pipeline {
    store: SharedStore,
    engine: SyncEngine,
    descriptors: Vec<SourceDescriptor>,
    analytics: AnalyticsEngine,
}

impl Pipeline {
    pub fn new(
        store: SharedStore,
        engine: SyncEngine,
        descriptors: Vec<SourceDescriptor>,
        analytics: AnalyticsEngine,
    ) -> Self {
        Self {
            store,
            engine,
            descriptors,
            analytics,
        }
    }

    /// The listing source (tab-separated tables) and the population API
    /// (JSON records), both behind one HTTP client.
    pub fn from_config(cfg: &AppConfig, store: SharedStore) -> Result<Self> {
        let client = http::build_client(&cfg.contact_email, cfg.fetch_timeout)
            .context("building HTTP client")?;

        let listing = SourceDescriptor::new(
            Arc::new(ListingSource::new(
                "bls",
                &cfg.bls_index_url,
                cfg.bls_files.clone(),
                client.clone(),
            )),
            cfg.bls_prefix.clone(),
        )
        .with_table(TableFormat::tab_separated());

        let population = SourceDescriptor::new(
            Arc::new(ApiSource::new(
                "population",
                cfg.population_api_url.clone(),
                POPULATION_FILE,
                client,
            )),
            cfg.population_raw_prefix.clone(),
        )
        .with_table(TableFormat::JsonRecords {
            path: cfg.population_data_path.clone(),
            required: vec!["year".into(), "population".into()],
        });

        let engine = SyncEngine::new(store.clone(), cfg.sync_settings());
        let analytics = AnalyticsEngine::new(store.clone(), cfg.analytics_config());
        Ok(Self::new(store, engine, vec![listing, population], analytics))
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub async fn ingest(&self) -> IngestReport {
        let sources = self.engine.run_all(&self.descriptors).await;
        let report = IngestReport { sources };
        info!(failed = report.failed(), "ingest finished");
        report
    }

    pub async fn analytics(&self) -> Result<AnalyticsReport, AnalyticsError> {
        self.analytics.run().await
    }
}
