use crate::services::{
    analytics::{AnalyticsConfig, YearRange},
    retry::RetryPolicy,
    sync_engine::SyncSettings,
    table_writer::table_key,
};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::{env, str::FromStr, time::Duration};

const DEFAULT_POPULATION_API_URL: &str = "https://honolulu-api.datausa.io/tesseract/data.jsonrecords?cube=acs_yg_total_population_1&drilldowns=Year%2CNation&locale=en&measures=Population";

/// Raw file the series analytics read.
pub const SERIES_FILE: &str = "pr.data.0.Current";
/// Stored name of the population API response.
pub const POPULATION_FILE: &str = "population.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Disk,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "disk" => Ok(StoreBackend::Disk),
            other => bail!("unknown store backend `{}` (expected `memory` or `disk`)", other),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store: StoreBackend,
    pub storage_dir: String,
    pub database_url: String,
    pub bucket: String,

    pub contact_email: String,
    pub bls_index_url: String,
    pub bls_prefix: String,
    /// Files mirrored from the listing; empty means every listed file.
    pub bls_files: Vec<String>,
    pub population_api_url: String,
    /// Path to the record array inside the API response.
    pub population_data_path: Vec<String>,
    pub population_raw_prefix: String,

    pub fetch_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub sync_concurrency: usize,

    pub year_range: YearRange,
    pub series_id: String,
    pub period: String,
    pub period_prefix: String,

    pub host: String,
    pub port: u16,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Mirror remote datasets into an object store and analyse them")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Store backend, `memory` or `disk` (overrides PIPELINE_STORE)
    #[arg(long, global = true)]
    pub store: Option<StoreBackend>,

    /// Directory where payloads are stored (overrides PIPELINE_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// Metadata database URL (overrides PIPELINE_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Host to bind to (overrides PIPELINE_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to (overrides PIPELINE_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Sync every remote source once and print the per-candidate report
    Ingest,
    /// Run the three analytics queries against the stored tables
    Analytics,
    /// Serve the object and trigger endpoints over HTTP
    Serve,
    /// Apply the metadata schema and exit
    Migrate,
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup; missing variables take their
    /// defaults, malformed ones are an error naming the variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());
        let list = |name: &str, default: &str, sep: char| -> Vec<String> {
            text(name, default)
                .split(sep)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        Ok(Self {
            store: parsed(&lookup, "PIPELINE_STORE", StoreBackend::Disk)?,
            storage_dir: text("PIPELINE_STORAGE_DIR", "./data/objects"),
            database_url: text("PIPELINE_DATABASE_URL", "sqlite://./data/meta/pipeline.db"),
            bucket: text("DATA_BUCKET", "quest-data"),

            contact_email: text("CONTACT_EMAIL", "data@example.com"),
            bls_index_url: text("BLS_INDEX_URL", "https://download.bls.gov/pub/time.series/pr/"),
            bls_prefix: text("BLS_PREFIX", "bls/"),
            bls_files: list("BLS_FILES", "pr.data.0.Current,pr.series", ','),
            population_api_url: text("POPULATION_API_URL", DEFAULT_POPULATION_API_URL),
            population_data_path: list("POPULATION_DATA_PATH", "data", '.'),
            population_raw_prefix: text("POPULATION_RAW_PREFIX", "population/raw/"),

            fetch_timeout: Duration::from_secs(parsed(&lookup, "FETCH_TIMEOUT_SECS", 30)?),
            max_retries: parsed(&lookup, "MAX_RETRIES", 3)?,
            retry_backoff: Duration::from_millis(parsed(&lookup, "RETRY_BACKOFF_MS", 200)?),
            sync_concurrency: parsed(&lookup, "SYNC_CONCURRENCY", 4)?,

            year_range: YearRange::new(
                parsed(&lookup, "ANALYTICS_YEAR_START", 2013)?,
                parsed(&lookup, "ANALYTICS_YEAR_END", 2018)?,
            ),
            series_id: text("ANALYTICS_SERIES_ID", "PRS30006032"),
            period: text("ANALYTICS_PERIOD", "Q01"),
            period_prefix: text("ANALYTICS_PERIOD_PREFIX", "Q"),

            host: text("PIPELINE_HOST", "0.0.0.0"),
            port: parsed(&lookup, "PIPELINE_PORT", 3000)?,
        })
    }

    /// Environment first, then CLI overrides.
    pub fn from_env_and_args(args: &Args) -> Result<Self> {
        let mut cfg = Self::from_env()?;
        cfg.apply_args(args);
        Ok(cfg)
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(store) = args.store {
            self.store = store;
        }
        if let Some(dir) = &args.storage_dir {
            self.storage_dir = dir.clone();
        }
        if let Some(url) = &args.database_url {
            self.database_url = url.clone();
        }
        if let Some(host) = &args.host {
            self.host = host.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            fetch_timeout: self.fetch_timeout,
            retry: RetryPolicy::new(self.max_retries, self.retry_backoff),
            concurrency: self.sync_concurrency,
        }
    }

    pub fn series_raw_key(&self) -> String {
        format!("{}{}", self.bls_prefix, SERIES_FILE)
    }

    pub fn population_raw_key(&self) -> String {
        format!("{}{}", self.population_raw_prefix, POPULATION_FILE)
    }

    pub fn analytics_config(&self) -> AnalyticsConfig {
        AnalyticsConfig {
            series_table_key: table_key(&self.series_raw_key()),
            population_table_key: table_key(&self.population_raw_key()),
            year_range: self.year_range,
            join_series_id: self.series_id.clone(),
            join_period: self.period.clone(),
            period_prefix: self.period_prefix.clone(),
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}
