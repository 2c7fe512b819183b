//! Query execution against the time-series store.
//!
//! [`QueryExecutor`] is the seam between the pipeline and the store. The
//! production implementation talks to InfluxDB over HTTP; tests use
//! [`MockExecutor`].

#[cfg(feature = "influx")]
pub mod influx;
mod mock;

pub use mock::MockExecutor;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ExecuteError;
use crate::query::FluxQuery;

/// One decoded row: timestamp, numeric value and its tag set.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub time: DateTime<Utc>,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
}

impl RawRecord {
    pub fn new(time: DateTime<Utc>, value: f64) -> Self {
        Self {
            time,
            value,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Records sharing one group key, in store order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub records: Vec<RawRecord>,
}

impl RawTable {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Runs Flux queries.
///
/// `Ok(vec![])` means the query ran and matched nothing; it is not an
/// error.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &FluxQuery) -> Result<Vec<RawTable>, ExecuteError>;
}
