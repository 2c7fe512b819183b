//! Wide series tables.
//!
//! Raw results arrive as long-format tables (one record per timestamp per
//! tag set). [`reshape`] turns them into a wide table: one row per
//! timestamp, one column per series.

mod reduce;

pub use reduce::reduce;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::error::DashboardError;
use crate::executor::RawTable;
use crate::fmt::format_clock;

/// Column name used when no pivot key is configured.
pub const VALUE_COLUMN: &str = "value";
/// Row key holding the formatted timestamp.
pub const TIME_COLUMN: &str = "time";

/// One named column.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

impl Series {
    /// Largest present value.
    pub fn max(&self) -> Option<f64> {
        self.values.iter().flatten().copied().reduce(f64::max)
    }

    /// Smallest present value.
    pub fn min(&self) -> Option<f64> {
        self.values.iter().flatten().copied().reduce(f64::min)
    }
}

/// Time-indexed table; every column has one value slot per row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesTable {
    times: Vec<DateTime<Utc>>,
    columns: Vec<Series>,
}

impl SeriesTable {
    pub fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    pub fn columns(&self) -> &[Series] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Series> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Row-oriented records `{time: "HH:MM", <series>: number|null, ...}`.
    ///
    /// Non-finite values become `null`.
    pub fn to_records(&self, tz: Tz) -> Vec<Map<String, Value>> {
        self.times
            .iter()
            .enumerate()
            .map(|(row, ts)| {
                let mut record = Map::with_capacity(self.columns.len() + 1);
                record.insert(TIME_COLUMN.to_string(), Value::String(format_clock(*ts, tz)));
                for column in &self.columns {
                    let value = column.values[row]
                        .and_then(Number::from_f64)
                        .map_or(Value::Null, Value::Number);
                    record.insert(column.name.clone(), value);
                }
                record
            })
            .collect()
    }
}

/// Reshapes raw tables into a [`SeriesTable`].
///
/// Without a pivot key all records form a single [`VALUE_COLUMN`] column,
/// in arrival order. With one, every distinct tag value becomes a column
/// (first-seen order) and rows are the distinct timestamps in ascending
/// order; the first value seen for a (timestamp, column) cell wins.
pub fn reshape(tables: &[RawTable], pivot: Option<&str>) -> Result<SeriesTable, DashboardError> {
    match tables.first() {
        None => return Err(DashboardError::EmptyResult),
        Some(first) if first.is_empty() => return Err(DashboardError::EmptyResult),
        _ => {}
    }

    match pivot {
        None => Ok(flatten(tables)),
        Some(key) => pivot_on(tables, key),
    }
}

fn flatten(tables: &[RawTable]) -> SeriesTable {
    let records = tables.iter().flat_map(|t| t.records.iter());
    let (times, values) = records.map(|r| (r.time, Some(r.value))).unzip();
    SeriesTable {
        times,
        columns: vec![Series {
            name: VALUE_COLUMN.to_string(),
            values,
        }],
    }
}

fn pivot_on(tables: &[RawTable], key: &str) -> Result<SeriesTable, DashboardError> {
    let mut names: Vec<String> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut rows: BTreeMap<DateTime<Utc>, HashMap<usize, f64>> = BTreeMap::new();
    let mut skipped = 0usize;

    for record in tables.iter().flat_map(|t| t.records.iter()) {
        let Some(tag) = record.tag(key) else {
            skipped += 1;
            continue;
        };
        let col = match positions.get(tag) {
            Some(&col) => col,
            None => {
                names.push(column_name(tag));
                positions.insert(tag.to_string(), names.len() - 1);
                names.len() - 1
            }
        };
        rows.entry(record.time)
            .or_default()
            .entry(col)
            .or_insert(record.value);
    }

    if skipped > 0 {
        debug!(pivot = key, skipped, "records without pivot tag skipped");
    }
    if rows.is_empty() {
        return Err(DashboardError::EmptyResult);
    }

    let times: Vec<DateTime<Utc>> = rows.keys().copied().collect();
    let columns = names
        .into_iter()
        .enumerate()
        .map(|(col, name)| Series {
            name,
            values: rows.values().map(|cells| cells.get(&col).copied()).collect(),
        })
        .collect();
    Ok(SeriesTable { times, columns })
}

/// Column name for a pivot tag value.
///
/// `time` and its underscore-suffixed forms gain one more `_`, which keeps
/// [`TIME_COLUMN`] free in records and distinct tags distinct.
fn column_name(tag: &str) -> String {
    match tag.strip_prefix(TIME_COLUMN) {
        Some(rest) if rest.bytes().all(|b| b == b'_') => format!("{}_", tag),
        _ => tag.to_string(),
    }
}
