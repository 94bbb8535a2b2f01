//! In-memory relational table used for structured copies and query results.
//!
//! Tables are persisted as CSV with a header row and no type information;
//! cell types are inferred again on read with [`Cell::parse`]. Any cell that
//! `Cell::parse` can produce survives the round trip unchanged. A hand-built
//! `Text` cell whose content looks numeric (`"007"`) or is empty does not:
//! it reads back as `Int(7)` or `Null`.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// One typed cell.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    /// Infer a typed cell from raw text. Surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Cell::Null;
        }
        if let Ok(v) = raw.parse::<i64>() {
            return Cell::Int(v);
        }
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Cell::Float(v),
            _ => Cell::Text(raw.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Int(v) => Some(*v),
            Cell::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    /// Textual view used for identifier comparisons (`series_id`, `period`).
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Int(v) => write!(f, "{}", v),
            // Debug keeps the fraction (`2.0`), so the cell parses back as a float.
            Cell::Float(v) => write!(f, "{:?}", v),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("column `{0}` is missing")]
pub struct MissingColumn(pub String);

/// Rows of typed columns. Every row has exactly `columns.len()` cells.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<Cell>) {
        debug_assert_eq!(row.len(), self.columns.len(), "row width mismatch");
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Result<usize, MissingColumn> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| MissingColumn(name.to_string()))
    }

    /// Cells of one column, in row order.
    pub fn column(&self, name: &str) -> Result<Vec<&Cell>, MissingColumn> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Serialize as CSV with a header row. Column types are not written.
    pub fn to_csv(&self) -> Result<Vec<u8>, csv::Error> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(|cell| cell.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|err| csv::Error::from(err.into_error()))
    }

    /// Parse CSV written by [`Table::to_csv`].
    pub fn from_csv(bytes: &[u8]) -> Result<Self, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(bytes);
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut table = Table::new(columns);
        for record in reader.records() {
            let record = record?;
            table.push_row(record.iter().map(Cell::parse).collect());
        }
        Ok(table)
    }
}
