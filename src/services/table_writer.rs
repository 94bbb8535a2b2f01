//! Structured copies of raw objects.
//!
//! A raw payload is parsed into a [`Table`] and written under
//! `<raw_key>.table` in one put, so the table is either fully regenerated or
//! left exactly as it was. The table's source marker is the content version
//! of the raw payload it was built from; a table whose marker differs from
//! the stored raw object is stale and gets rebuilt.

use crate::{
    models::{
        object::{ObjectMeta, VersionMarker},
        sync::TableOutcome,
        table::{Cell, Table},
    },
    services::{
        object_store::{ObjectStore, SharedStore, StoreError},
        retry::RetryPolicy,
    },
};
use bytes::Bytes;
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How a raw payload becomes rows.
#[derive(Debug, Clone, PartialEq)]
pub enum TableFormat {
    /// Delimited text with a header row. Cells and headers are trimmed.
    Delimited { delimiter: u8 },
    /// JSON array of flat records found by walking `path` from the root.
    JsonRecords {
        path: Vec<String>,
        required: Vec<String>,
    },
}

impl TableFormat {
    pub fn tab_separated() -> Self {
        TableFormat::Delimited { delimiter: b'\t' }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("cannot parse `{key}`: {reason}")]
pub struct ParseError {
    pub key: String,
    pub reason: String,
}

impl ParseError {
    fn new(key: &str, reason: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot encode table: {0}")]
    Encode(#[from] csv::Error),
}

pub const TABLE_SUFFIX: &str = ".table";

/// Key of the structured copy of `raw_key`.
pub fn table_key(raw_key: &str) -> String {
    format!("{}{}", raw_key, TABLE_SUFFIX)
}

/// Column names are trimmed and lower-cased (`Year` and `year ` both become
/// `year`).
fn normalize_column(name: &str) -> String {
    name.trim().to_lowercase()
}

pub fn parse_table(key: &str, bytes: &[u8], format: &TableFormat) -> Result<Table, ParseError> {
    match format {
        TableFormat::Delimited { delimiter } => parse_delimited(key, bytes, *delimiter),
        TableFormat::JsonRecords { path, required } => parse_json_records(key, bytes, path, required),
    }
}

fn parse_delimited(key: &str, bytes: &[u8], delimiter: u8) -> Result<Table, ParseError> {
    let text = std::str::from_utf8(bytes).map_err(|err| ParseError::new(key, err.to_string()))?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|err| ParseError::new(key, err.to_string()))?;
    if headers.iter().all(|h| h.trim().is_empty()) {
        return Err(ParseError::new(key, "missing header row"));
    }
    let mut table = Table::new(headers.iter().map(normalize_column));

    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|err| ParseError::new(key, format!("row {}: {}", line + 1, err)))?;
        table.push_row(record.iter().map(Cell::parse).collect());
    }
    Ok(table)
}

fn json_cell(value: &Value) -> Cell {
    match value {
        Value::Null => Cell::Null,
        Value::Number(n) => match n.as_i64() {
            Some(v) => Cell::Int(v),
            None => n.as_f64().map(Cell::Float).unwrap_or(Cell::Null),
        },
        Value::String(s) => Cell::parse(s),
        Value::Bool(b) => Cell::Text(b.to_string()),
        nested => Cell::Text(nested.to_string()),
    }
}

fn parse_json_records(
    key: &str,
    bytes: &[u8],
    path: &[String],
    required: &[String],
) -> Result<Table, ParseError> {
    let root: Value =
        serde_json::from_slice(bytes).map_err(|err| ParseError::new(key, err.to_string()))?;

    let mut node = &root;
    for segment in path {
        node = node
            .get(segment)
            .ok_or_else(|| ParseError::new(key, format!("no `{}` field at extraction path", segment)))?;
    }
    let records = node
        .as_array()
        .ok_or_else(|| ParseError::new(key, "extraction path does not point at an array"))?;

    let mut rows = Vec::with_capacity(records.len());
    let mut seen = BTreeSet::new();
    for (idx, record) in records.iter().enumerate() {
        let fields = record
            .as_object()
            .ok_or_else(|| ParseError::new(key, format!("record {} is not an object", idx)))?;
        let normalized: Vec<(String, &Value)> = fields
            .iter()
            .map(|(name, value)| (normalize_column(name), value))
            .collect();
        seen.extend(normalized.iter().map(|(name, _)| name.clone()));
        rows.push(normalized);
    }

    // Required columns first, in declared order, then the rest sorted.
    let required: Vec<String> = required.iter().map(|c| normalize_column(c)).collect();
    let mut columns = required.clone();
    columns.extend(seen.into_iter().filter(|c| !required.contains(c)));

    let mut table = Table::new(columns.clone());
    for (idx, fields) in rows.into_iter().enumerate() {
        for column in &required {
            if !fields.iter().any(|(name, _)| name == column) {
                return Err(ParseError::new(
                    key,
                    format!("record {} is missing required field `{}`", idx, column),
                ));
            }
        }
        table.push_row(
            columns
                .iter()
                .map(|column| {
                    fields
                        .iter()
                        .find(|(name, _)| name == column)
                        .map(|(_, value)| json_cell(value))
                        .unwrap_or(Cell::Null)
                })
                .collect(),
        );
    }
    Ok(table)
}

/// Sole writer of structured-table keys.
#[derive(Clone)]
pub struct TableWriter {
    store: SharedStore,
    retry: RetryPolicy,
}

impl TableWriter {
    pub fn new(store: SharedStore, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Parse `bytes` and replace the table for `raw_key` in one put.
    pub async fn write(
        &self,
        raw_key: &str,
        bytes: &[u8],
        format: &TableFormat,
    ) -> Result<(String, usize), TableError> {
        let table = parse_table(raw_key, bytes, format)?;
        let encoded = Bytes::from(table.to_csv()?);
        let key = table_key(raw_key);
        let built_from = VersionMarker::from_content(bytes);

        let store = self.store.as_ref();
        let target = key.as_str();
        self.retry
            .run(
                "table put",
                move || store.put(target, encoded.clone(), built_from.clone()),
                StoreError::is_transient,
            )
            .await?;
        info!(key = %key, rows = table.len(), "wrote structured table");
        Ok((key, table.len()))
    }

    /// Rebuild the table for `raw_key` unless it was already built from the
    /// current raw content. `fresh` holds the raw bytes when the caller has
    /// them at hand; otherwise the stored raw object is read. Returns `None`
    /// when the existing table was left untouched.
    pub async fn refresh(
        &self,
        raw_key: &str,
        fresh: Option<&Bytes>,
        format: &TableFormat,
    ) -> Option<TableOutcome> {
        let key = table_key(raw_key);
        match self.rebuild_if_stale(raw_key, &key, fresh, format).await {
            Ok(None) => {
                debug!(key = %key, "table up to date");
                None
            }
            Ok(Some((key, rows))) => Some(TableOutcome::Written { key, rows }),
            Err(err) => {
                warn!(key = %key, error = %err, "table regeneration failed");
                Some(TableOutcome::Failed {
                    key,
                    error: err.to_string(),
                })
            }
        }
    }

    async fn rebuild_if_stale(
        &self,
        raw_key: &str,
        key: &str,
        fresh: Option<&Bytes>,
        format: &TableFormat,
    ) -> Result<Option<(String, usize)>, TableError> {
        let raw_version = match fresh {
            Some(bytes) => VersionMarker::from_content(bytes),
            None => self.stat(raw_key).await?.content_version,
        };
        match self.stat(key).await {
            Ok(table) if table.source_marker == raw_version => return Ok(None),
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let written = match fresh {
            Some(bytes) => self.write(raw_key, bytes, format).await?,
            None => {
                let store = self.store.as_ref();
                let raw = self
                    .retry
                    .run("raw get", move || store.get(raw_key), StoreError::is_transient)
                    .await?;
                self.write(raw_key, &raw.bytes, format).await?
            }
        };
        Ok(Some(written))
    }

    async fn stat(&self, key: &str) -> Result<ObjectMeta, StoreError> {
        let store = self.store.as_ref();
        self.retry
            .run("stat", move || store.stat(key), StoreError::is_transient)
            .await
    }
}
