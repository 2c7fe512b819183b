use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{QueryExecutor, RawTable};
use crate::error::ExecuteError;
use crate::query::FluxQuery;

/// In-memory executor for tests.
///
/// Answers are keyed by the query's `_measurement`. Unknown measurements
/// return an empty (successful) result. Every executed query is recorded
/// as rendered Flux text.
#[derive(Default)]
pub struct MockExecutor {
    responses: HashMap<String, Result<Vec<RawTable>, ExecuteError>>,
    delays: HashMap<String, Duration>,
    executed: Mutex<Vec<String>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables(mut self, measurement: &str, tables: Vec<RawTable>) -> Self {
        self.responses.insert(measurement.to_string(), Ok(tables));
        self
    }

    pub fn with_error(mut self, measurement: &str, error: ExecuteError) -> Self {
        self.responses.insert(measurement.to_string(), Err(error));
        self
    }

    /// Sleeps before answering queries on `measurement`.
    pub fn with_delay(mut self, measurement: &str, delay: Duration) -> Self {
        self.delays.insert(measurement.to_string(), delay);
        self
    }

    /// Rendered queries in execution order.
    pub fn executed(&self) -> Vec<String> {
        match self.executed.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl QueryExecutor for MockExecutor {
    async fn execute(&self, query: &FluxQuery) -> Result<Vec<RawTable>, ExecuteError> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(query.to_string());
        }
        let measurement = query.measurement().unwrap_or_default();
        if let Some(delay) = self.delays.get(measurement) {
            tokio::time::sleep(*delay).await;
        }
        self.responses
            .get(measurement)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}
