//! Widget orchestration.
//!
//! For each widget: resolve its time window, then for each query build the
//! Flux pipeline, execute it, reshape and optionally reduce the result.
//! Every (widget, query) pair runs as its own tokio task, bounded by a
//! semaphore and a per-query deadline. Results are joined back in slot and
//! query order; a failed, timed out or empty query leaves `None` in its
//! slot without affecting its siblings.

mod result;

pub use result::{DashboardResult, WidgetResult};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_tz::Tz;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregation::AggregationConfig;
use crate::config::{DashboardDocument, RequestedRange, SeriesLimit, WidgetConfig};
use crate::error::{DashboardError, ExecuteError};
use crate::executor::QueryExecutor;
use crate::query::{FluxQuery, build_query};
use crate::table::{SeriesTable, reduce, reshape};
use crate::util::resolve_window;

/// Default number of queries in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
/// Default per-query deadline.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct DashboardSettings {
    pub aggregation: AggregationConfig,
    /// Zone explicit requested ranges are written in.
    pub reference_tz: Tz,
    pub max_concurrency: usize,
    pub query_timeout: Duration,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            aggregation: AggregationConfig::default(),
            reference_tz: chrono_tz::Europe::London,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// Per-request parameters.
#[derive(Debug, Clone)]
pub struct DashboardRequest {
    /// Custom range start, applied to every widget.
    pub from: Option<String>,
    /// Custom range end, applied to every widget.
    pub to: Option<String>,
    /// Display zone for result timestamps.
    pub timezone: Tz,
}

impl Default for DashboardRequest {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            timezone: chrono_tz::Europe::London,
        }
    }
}

/// Runs dashboards against a [`QueryExecutor`].
pub struct Orchestrator {
    executor: Arc<dyn QueryExecutor>,
    settings: DashboardSettings,
    permits: Arc<Semaphore>,
}

struct UnitOutcome {
    started: Instant,
    finished: Instant,
    table: Option<SeriesTable>,
}

/// One (widget, query) pair, ready to run on its own task.
struct QueryUnit {
    executor: Arc<dyn QueryExecutor>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    widget: u8,
    index: usize,
    query: FluxQuery,
    pivot: Option<String>,
    limit: Option<SeriesLimit>,
}

struct PendingWidget {
    id: u8,
    config: WidgetConfig,
    units: Vec<Option<JoinHandle<UnitOutcome>>>,
}

impl Orchestrator {
    pub fn new(executor: Arc<dyn QueryExecutor>, settings: DashboardSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrency.max(1)));
        Self {
            executor,
            settings,
            permits,
        }
    }

    pub fn settings(&self) -> &DashboardSettings {
        &self.settings
    }

    /// Runs every widget of `document`.
    ///
    /// All queries of all widgets are dispatched before any is awaited.
    pub async fn run_dashboard(
        &self,
        document: &DashboardDocument,
        request: &DashboardRequest,
    ) -> DashboardResult {
        let started = Instant::now();
        let mut document = document.clone();
        document.inject_requested_range(request.from.as_deref(), request.to.as_deref());

        let pending: Vec<PendingWidget> = document
            .widgets
            .iter()
            .map(|(&id, widget)| self.dispatch(id, widget))
            .collect();

        let mut widgets = Vec::with_capacity(pending.len());
        for widget in pending {
            widgets.push(self.collect(widget, request.timezone).await);
        }

        info!(
            widgets = widgets.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dashboard assembled"
        );
        DashboardResult {
            widgets,
            sensor_list: document.sensor_list,
        }
    }

    /// Runs a single widget; `request.from`/`to` override its range.
    pub async fn run_widget(
        &self,
        id: u8,
        widget: &WidgetConfig,
        request: &DashboardRequest,
    ) -> WidgetResult {
        let mut widget = widget.clone();
        if request.from.is_some() || request.to.is_some() {
            widget.requested_range = Some(RequestedRange {
                start: request.from.clone(),
                end: request.to.clone(),
            });
        }
        let pending = self.dispatch(id, &widget);
        self.collect(pending, request.timezone).await
    }

    fn dispatch(&self, id: u8, widget: &WidgetConfig) -> PendingWidget {
        let window = resolve_window(
            &widget.default_range,
            widget.requested_range.as_ref(),
            self.settings.reference_tz,
            Utc::now(),
        );

        let units = widget
            .queries
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let query = match build_query(
                    spec,
                    window,
                    widget.kind,
                    widget.minimised,
                    &self.settings.aggregation,
                ) {
                    Ok(query) => query,
                    Err(e) => {
                        error!(widget = id, query = index, error = %e, "failed to build query");
                        return None;
                    }
                };
                let unit = QueryUnit {
                    executor: Arc::clone(&self.executor),
                    permits: Arc::clone(&self.permits),
                    timeout: self.settings.query_timeout,
                    widget: id,
                    index,
                    query,
                    pivot: spec.pivot.clone(),
                    limit: spec.limit,
                };
                Some(tokio::spawn(unit.run()))
            })
            .collect();

        PendingWidget {
            id,
            config: widget.clone(),
            units,
        }
    }

    async fn collect(&self, pending: PendingWidget, timezone: Tz) -> WidgetResult {
        let PendingWidget { id, config, units } = pending;
        let mut data = Vec::with_capacity(units.len());
        let mut span: Option<(Instant, Instant)> = None;

        for (index, unit) in units.into_iter().enumerate() {
            let Some(handle) = unit else {
                data.push(None);
                continue;
            };
            match handle.await {
                Ok(outcome) => {
                    span = Some(match span {
                        Some((first, last)) => {
                            (first.min(outcome.started), last.max(outcome.finished))
                        }
                        None => (outcome.started, outcome.finished),
                    });
                    data.push(outcome.table);
                }
                Err(e) => {
                    error!(widget = id, query = index, error = %e, "query task aborted");
                    data.push(None);
                }
            }
        }

        let execution_time = span.map_or(Duration::ZERO, |(first, last)| last - first);
        info!(
            widget = id,
            queries = data.len(),
            empty = data.iter().filter(|d| d.is_none()).count(),
            execution_ms = execution_time.as_millis() as u64,
            "widget assembled"
        );

        WidgetResult {
            id,
            series: WidgetResult::derive_series(&data),
            config,
            data,
            execution_time,
            timezone,
        }
    }
}

impl QueryUnit {
    async fn run(self) -> UnitOutcome {
        // Never closed, so acquisition only fails if the orchestrator is gone.
        let _permit = self.permits.acquire().await.ok();
        let started = Instant::now();

        let execution = self.executor.execute(&self.query);
        let executed = match tokio::time::timeout(self.timeout, execution).await {
            Ok(result) => result.map_err(DashboardError::from),
            Err(_) => Err(ExecuteError::Timeout(self.timeout).into()),
        };
        let table = executed
            .and_then(|tables| reshape(&tables, self.pivot.as_deref()))
            .map(|table| match self.limit {
                Some(limit) => reduce(table, limit.count, limit.selector),
                None => table,
            });

        let finished = Instant::now();
        let elapsed_ms = (finished - started).as_millis() as u64;
        let table = match table {
            Ok(table) => {
                info!(
                    widget = self.widget,
                    query = self.index,
                    rows = table.len(),
                    series = table.columns().len(),
                    elapsed_ms,
                    "query completed"
                );
                Some(table)
            }
            Err(DashboardError::EmptyResult) => {
                info!(
                    widget = self.widget,
                    query = self.index,
                    elapsed_ms,
                    "query returned no data"
                );
                None
            }
            Err(e) => {
                warn!(
                    widget = self.widget,
                    query = self.index,
                    elapsed_ms,
                    error = %e,
                    "query failed"
                );
                None
            }
        };

        UnitOutcome {
            started,
            finished,
            table,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{MockExecutor, RawRecord, RawTable};
    use chrono::{DateTime, TimeDelta, TimeZone};
    use serde_json::{Value, json};

    fn at(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 28, 10, 15, 0).single().unwrap() + TimeDelta::minutes(min)
    }

    fn readings(sensors: &[(&str, f64)]) -> Vec<RawTable> {
        sensors
            .iter()
            .map(|(sensor, base)| {
                RawTable::new(
                    (0..3)
                        .map(|i| RawRecord::new(at(i), base + i as f64).with_tag("sensor", *sensor))
                        .collect(),
                )
            })
            .collect()
    }

    fn orchestrator(
        mock: MockExecutor,
        settings: DashboardSettings,
    ) -> (Arc<MockExecutor>, Orchestrator) {
        let mock = Arc::new(mock);
        let orchestrator = Orchestrator::new(mock.clone(), settings);
        (mock, orchestrator)
    }

    fn document(value: Value) -> DashboardDocument {
        DashboardDocument::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_graph_hour_without_pivot() {
        let (mock, orch) = orchestrator(
            MockExecutor::new().with_tables("load", readings(&[("A", 1.0)])),
            DashboardSettings::default(),
        );
        let doc = document(json!({
            "SensorList": ["Spindle"],
            "1": {"Type": "Graph", "DefaultRange": "1h", "Minimised": false,
                  "Queries": [{"Bucket": "machines", "Measurement": "load"}]}
        }));

        let result = orch.run_dashboard(&doc, &DashboardRequest::default()).await;
        assert_eq!(result.widgets.len(), 1);
        let widget = &result.widgets[0];
        assert_eq!(widget.series, vec!["value"]);
        let table = widget.data[0].as_ref().unwrap();
        assert_eq!(table.len(), 3);

        let executed = mock.executed();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].contains("aggregateWindow(every: 5s, fn: mean, createEmpty: false)"));

        let envelope = serde_json::to_value(&result).unwrap();
        assert_eq!(envelope[0]["data"][0][0], json!({"time": "11:15", "value": 1.0}));
        assert_eq!(envelope[1], json!({"sensor_list": ["Spindle"]}));
    }

    #[tokio::test]
    async fn test_failures_stay_index_aligned() {
        let (_, orch) = orchestrator(
            MockExecutor::new()
                .with_tables("ok", readings(&[("A", 1.0)]))
                .with_error("broken", ExecuteError::Transport("connection reset".into()))
                .with_tables("ok2", readings(&[("B", 5.0)])),
            DashboardSettings::default(),
        );
        let doc = document(json!({
            "2": {"Type": "Graph", "DefaultRange": "6h", "Queries": [
                {"Bucket": "b", "Measurement": "ok", "Pivot": "sensor"},
                {"Bucket": "b", "Measurement": "broken"},
                {"Bucket": "b", "Measurement": "nothing"},
                {"Bucket": "b", "Measurement": "ok2", "Pivot": "sensor"}
            ]}
        }));

        let result = orch.run_dashboard(&doc, &DashboardRequest::default()).await;
        let data = &result.widgets[0].data;
        assert_eq!(data.len(), 4);
        assert!(data[0].is_some());
        assert!(data[1].is_none());
        assert!(data[2].is_none());
        assert!(data[3].is_some());
        assert_eq!(result.widgets[0].series, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_timeout_degrades_to_null() {
        let settings = DashboardSettings {
            query_timeout: Duration::from_millis(50),
            ..DashboardSettings::default()
        };
        let (_, orch) = orchestrator(
            MockExecutor::new()
                .with_tables("slow", readings(&[("A", 1.0)]))
                .with_delay("slow", Duration::from_secs(5))
                .with_tables("fast", readings(&[("A", 1.0)])),
            settings,
        );
        let doc = document(json!({
            "1": {"Type": "Graph", "DefaultRange": "1h", "Queries": [
                {"Bucket": "b", "Measurement": "slow"},
                {"Bucket": "b", "Measurement": "fast"}
            ]}
        }));

        let started = Instant::now();
        let result = orch.run_dashboard(&doc, &DashboardRequest::default()).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.widgets[0].data[0].is_none());
        assert!(result.widgets[0].data[1].is_some());
    }

    #[tokio::test]
    async fn test_custom_range_is_injected() {
        let (mock, orch) = orchestrator(MockExecutor::new(), DashboardSettings::default());
        let doc = document(json!({
            "1": {"Type": "Graph", "DefaultRange": "24h",
                  "Queries": [{"Bucket": "b", "Measurement": "m"}]},
            "3": {"Type": "Stat", "DefaultRange": "1h", "Minimised": true,
                  "Queries": [{"Bucket": "b", "Measurement": "m"}]}
        }));
        let request = DashboardRequest {
            from: Some("2025-07-28T11:15".into()),
            to: Some("2025-07-28T12:15".into()),
            ..DashboardRequest::default()
        };

        let result = orch.run_dashboard(&doc, &request).await;
        assert_eq!(result.widgets.len(), 2);
        let executed = mock.executed();
        assert_eq!(executed.len(), 2);
        for query in &executed {
            // BST: local 11:15 is 10:15 UTC
            assert!(
                query.contains("range(start: 2025-07-28T10:15:00Z, stop: 2025-07-28T11:15:00Z)")
            );
        }
        assert!(executed.iter().any(|q| q.ends_with("|> last()")));
        assert_eq!(
            result.widgets[0].config.requested_range.as_ref().unwrap().start.as_deref(),
            Some("2025-07-28T11:15")
        );
    }

    #[tokio::test]
    async fn test_bad_custom_range_falls_back_to_default() {
        let (mock, orch) = orchestrator(MockExecutor::new(), DashboardSettings::default());
        let doc = document(json!({
            "1": {"Type": "Graph", "DefaultRange": "1h",
                  "Queries": [{"Bucket": "b", "Measurement": "m"}]}
        }));
        let request = DashboardRequest {
            from: Some("yesterday".into()),
            to: None,
            ..DashboardRequest::default()
        };
        let result = orch.run_dashboard(&doc, &request).await;
        assert_eq!(result.widgets[0].data, vec![None]);
        assert!(mock.executed()[0].contains("every: 5s"));
    }

    #[tokio::test]
    async fn test_pivot_limit_and_display_zone() {
        let (_, orch) = orchestrator(
            MockExecutor::new()
                .with_tables("temp", readings(&[("A", 1.0), ("B", 50.0), ("C", 20.0)])),
            DashboardSettings::default(),
        );
        let doc = document(json!({
            "1": {"Type": "Graph", "DefaultRange": "1h", "Queries": [
                {"Bucket": "b", "Measurement": "temp", "Pivot": "sensor",
                 "Limit": 2, "LimitType": "Max"}
            ]}
        }));
        let request = DashboardRequest {
            timezone: chrono_tz::Asia::Tokyo,
            ..DashboardRequest::default()
        };

        let widget = orch.run_widget(1, &doc.widgets[&1], &request).await;
        assert_eq!(widget.series, vec!["B", "C"]);
        let envelope = serde_json::to_value(&widget).unwrap();
        assert_eq!(envelope["data"][0][0]["time"], "19:15");
        assert_eq!(envelope["config"]["Series"], json!(["B", "C"]));
    }

    #[tokio::test]
    async fn test_single_permit_still_completes_everything() {
        let settings = DashboardSettings {
            max_concurrency: 1,
            ..DashboardSettings::default()
        };
        let (mock, orch) = orchestrator(
            MockExecutor::new()
                .with_tables("a", readings(&[("A", 1.0)]))
                .with_delay("a", Duration::from_millis(20))
                .with_tables("b", readings(&[("B", 1.0)])),
            settings,
        );
        let doc = document(json!({
            "1": {"Type": "Graph", "DefaultRange": "1h",
                  "Queries": [{"Bucket": "b", "Measurement": "a"}]},
            "2": {"Type": "Graph", "DefaultRange": "1h",
                  "Queries": [{"Bucket": "b", "Measurement": "b"}]}
        }));
        let result = orch.run_dashboard(&doc, &DashboardRequest::default()).await;
        assert!(result.widgets.iter().all(|w| w.data[0].is_some()));
        assert_eq!(result.widgets.iter().map(|w| w.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(mock.executed().len(), 2);
        assert!(result.widgets[0].execution_time >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_widget_without_queries() {
        let (_, orch) = orchestrator(MockExecutor::new(), DashboardSettings::default());
        let doc = document(json!({"1": {"Type": "Stat", "DefaultRange": "1h"}}));
        let result = orch.run_dashboard(&doc, &DashboardRequest::default()).await;
        assert!(result.widgets[0].data.is_empty());
        assert_eq!(result.widgets[0].execution_time, Duration::ZERO);
        assert!(result.sensor_list.is_empty());
    }
}
