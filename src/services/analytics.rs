//! Analytics over the structured tables: population statistics, best year
//! per series, and the series/population join.
//!
//! The engine only reads from the store. Each query is a pure function of its
//! input tables, so identical inputs always give identical rows in the same
//! order.

use crate::{
    models::table::{Cell, MissingColumn, Table},
    services::object_store::{ObjectStore, SharedStore, StoreError},
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};
use thiserror::Error;
use tracing::{info, instrument};

/// Inclusive range of years.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearRange {
    pub start: i64,
    pub end: i64,
}

impl YearRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, year: i64) -> bool {
        (self.start..=self.end).contains(&year)
    }
}

impl fmt::Display for YearRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    /// Structured time-series table (`series_id, year, period, value`).
    pub series_table_key: String,
    /// Structured population table (`year, population`).
    pub population_table_key: String,
    pub year_range: YearRange,
    /// Series id the join query filters on.
    pub join_series_id: String,
    /// Period label the join query filters on.
    pub join_period: String,
    /// Only periods starting with this prefix count towards the yearly sums.
    pub period_prefix: String,
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("input table `{key}` is missing")]
    MissingTable { key: String },
    #[error("input table `{key}` is malformed: {reason}")]
    MalformedTable { key: String, reason: String },
    #[error("reading `{key}` failed: {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },
}

/// The three result tables. Returned to the caller, never persisted here.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnalyticsReport {
    pub population_stats: Table,
    pub best_year: Table,
    pub series_population: Table,
}

const SERIES_COLUMNS: [&str; 4] = ["series_id", "year", "period", "value"];
const POPULATION_COLUMNS: [&str; 2] = ["year", "population"];

pub struct AnalyticsEngine {
    store: SharedStore,
    config: AnalyticsConfig,
}

impl AnalyticsEngine {
    pub fn new(store: SharedStore, config: AnalyticsConfig) -> Self {
        Self { store, config }
    }

    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<AnalyticsReport, AnalyticsError> {
        let series_key = &self.config.series_table_key;
        let population_key = &self.config.population_table_key;
        let series = self.load(series_key, &SERIES_COLUMNS).await?;
        let population = self.load(population_key, &POPULATION_COLUMNS).await?;

        let report = AnalyticsReport {
            population_stats: population_stats(&population, self.config.year_range)
                .map_err(|err| malformed(population_key, err))?,
            best_year: best_year_by_series(&series, &self.config.period_prefix)
                .map_err(|err| malformed(series_key, err))?,
            series_population: series_with_population(
                &series,
                &population,
                &self.config.join_series_id,
                &self.config.join_period,
            )
            .map_err(|err| malformed(series_key, err))?,
        };
        info!(
            population_stats = report.population_stats.len(),
            best_year = report.best_year.len(),
            series_population = report.series_population.len(),
            "analytics complete"
        );
        Ok(report)
    }

    /// Read a structured table and check it has the columns the queries use.
    async fn load(&self, key: &str, required: &[&str]) -> Result<Table, AnalyticsError> {
        let object = self.store.get(key).await.map_err(|err| match err {
            StoreError::NotFound(_) => AnalyticsError::MissingTable {
                key: key.to_string(),
            },
            other => AnalyticsError::Store {
                key: key.to_string(),
                source: other,
            },
        })?;
        let table = Table::from_csv(&object.bytes).map_err(|err| AnalyticsError::MalformedTable {
            key: key.to_string(),
            reason: err.to_string(),
        })?;
        for column in required {
            table
                .column_index(column)
                .map_err(|err| malformed(key, err))?;
        }
        Ok(table)
    }
}

fn malformed(key: &str, err: MissingColumn) -> AnalyticsError {
    AnalyticsError::MalformedTable {
        key: key.to_string(),
        reason: err.to_string(),
    }
}

/// Mean and population standard deviation of `population` over the years in
/// `range`. With no matching rows the statistics are null.
pub fn population_stats(population: &Table, range: YearRange) -> Result<Table, MissingColumn> {
    let year = population.column_index("year")?;
    let value = population.column_index("population")?;

    let values: Vec<f64> = population
        .rows
        .iter()
        .filter(|row| row[year].as_i64().is_some_and(|y| range.contains(y)))
        .filter_map(|row| row[value].as_f64())
        .collect();

    let mut table = Table::new(["year_range", "count", "mean", "stddev"]);
    let (mean, stddev) = if values.is_empty() {
        (Cell::Null, Cell::Null)
    } else {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        (Cell::Float(mean), Cell::Float(variance.sqrt()))
    };
    table.push_row(vec![
        Cell::Text(range.to_string()),
        Cell::Int(values.len() as i64),
        mean,
        stddev,
    ]);
    Ok(table)
}

/// For each series, the year whose summed `value` (over periods starting
/// with `period_prefix`) is largest. Ties go to the smallest year. Rows are
/// ordered by series id; non-numeric values are ignored.
pub fn best_year_by_series(series: &Table, period_prefix: &str) -> Result<Table, MissingColumn> {
    let series_id = series.column_index("series_id")?;
    let year = series.column_index("year")?;
    let period = series.column_index("period")?;
    let value = series.column_index("value")?;

    let mut sums: BTreeMap<String, BTreeMap<i64, f64>> = BTreeMap::new();
    for row in &series.rows {
        let in_scope = row[period]
            .as_text()
            .is_some_and(|p| p.starts_with(period_prefix));
        let (Some(id), Some(y), Some(v)) = (row[series_id].as_text(), row[year].as_i64(), row[value].as_f64())
        else {
            continue;
        };
        if in_scope {
            *sums.entry(id.to_string()).or_default().entry(y).or_default() += v;
        }
    }

    let mut table = Table::new(["series_id", "year", "value"]);
    for (id, by_year) in sums {
        // Years iterate ascending and only a strictly larger sum replaces the
        // current best, so the smallest year wins a tie.
        let mut best: Option<(i64, f64)> = None;
        for (y, total) in by_year {
            if best.is_none_or(|(_, best_total)| total > best_total) {
                best = Some((y, total));
            }
        }
        if let Some((y, total)) = best {
            table.push_row(vec![Cell::Text(id), Cell::Int(y), Cell::Float(total)]);
        }
    }
    Ok(table)
}

/// Rows of `series` for one series id and period, inner-joined on year with
/// `population`. Years missing from either side are dropped; output is
/// ordered by year.
pub fn series_with_population(
    series: &Table,
    population: &Table,
    series_id: &str,
    period: &str,
) -> Result<Table, MissingColumn> {
    let s_id = series.column_index("series_id")?;
    let s_year = series.column_index("year")?;
    let s_period = series.column_index("period")?;
    let s_value = series.column_index("value")?;
    let p_year = population.column_index("year")?;
    let p_value = population.column_index("population")?;

    let mut by_year: HashMap<i64, &Cell> = HashMap::new();
    for row in &population.rows {
        if let Some(y) = row[p_year].as_i64() {
            by_year.entry(y).or_insert(&row[p_value]);
        }
    }

    let mut joined: Vec<(i64, Vec<Cell>)> = series
        .rows
        .iter()
        .filter(|row| row[s_id].as_text() == Some(series_id) && row[s_period].as_text() == Some(period))
        .filter_map(|row| {
            let y = row[s_year].as_i64()?;
            let pop = by_year.get(&y)?;
            Some((
                y,
                vec![
                    row[s_id].clone(),
                    Cell::Int(y),
                    row[s_period].clone(),
                    row[s_value].clone(),
                    (*pop).clone(),
                ],
            ))
        })
        .collect();
    joined.sort_by_key(|(y, _)| *y);

    let mut table = Table::new(["series_id", "year", "period", "value", "population"]);
    for (_, row) in joined {
        table.push_row(row);
    }
    Ok(table)
}
