//! Dashboard document schema.
//!
//! A document maps widget slots `"1"`..`"9"` to widget objects, plus an
//! optional `SensorList` passed through to the response untouched:
//!
//! ```json
//! {
//!   "SensorList": ["X-Axis", "Spindle"],
//!   "1": {
//!     "Type": "Graph", "DefaultRange": "1h", "Minimised": false,
//!     "Title": "Spindle load",
//!     "Queries": [{"Bucket": "machines", "Measurement": "load", "Pivot": "sensor"}]
//!   }
//! }
//! ```
//!
//! Everything is validated once here; the pipeline only sees typed
//! [`WidgetConfig`] / [`QuerySpec`] values.

mod query;

pub use query::{
    AggregateFn, LimitType, Predicate, PredicateValue, QuerySpec, ScaleExpr, ScaleOp, SeriesLimit,
};

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::Path;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{ConfigError, DashboardError};
use crate::util::RelativeRange;
use query::RawQuerySpec;

/// Widget slot keys read from a document.
pub const WIDGET_SLOTS: RangeInclusive<u8> = 1..=9;

/// Key of the passthrough sensor list.
pub const SENSOR_LIST_KEY: &str = "SensorList";

/// Panel display kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WidgetKind {
    /// Single value.
    Stat,
    /// Time-series chart.
    Graph,
}

/// Explicit window in the reference timezone, e.g. `2025-07-28T11:15`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Validated widget definition.
///
/// Serializes to the envelope's `config` object: document keys minus
/// `Queries`.
#[derive(Debug, Clone, Serialize)]
pub struct WidgetConfig {
    #[serde(rename = "Type")]
    pub kind: WidgetKind,
    #[serde(rename = "DefaultRange", serialize_with = "serialize_display")]
    pub default_range: RelativeRange,
    #[serde(rename = "Minimised")]
    pub minimised: bool,
    #[serde(rename = "RequestedRange", skip_serializing_if = "Option::is_none")]
    pub requested_range: Option<RequestedRange>,
    #[serde(skip)]
    pub queries: Vec<QuerySpec>,
    /// Display metadata (titles, units, ...) kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn serialize_display<S: Serializer>(
    value: &RelativeRange,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawWidgetConfig {
    #[serde(rename = "Type")]
    kind: Option<WidgetKind>,
    default_range: Option<String>,
    minimised: Option<bool>,
    requested_range: Option<RequestedRange>,
    #[serde(default)]
    queries: Vec<Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Attaches `scope` to config errors; other variants pass through.
fn scoped(err: DashboardError, scope: &str) -> DashboardError {
    match err {
        DashboardError::Config(e) => DashboardError::Config(e.within(scope)),
        other => other,
    }
}

impl WidgetConfig {
    /// Validates one widget object.
    pub fn from_value(value: Value) -> Result<Self, DashboardError> {
        let raw: RawWidgetConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::new("", e.to_string()))?;

        let kind = raw.kind.ok_or_else(|| ConfigError::missing("Type"))?;
        let default_range = match raw.default_range.as_deref() {
            Some(token) => RelativeRange::parse(token)?,
            None => return Err(ConfigError::missing("DefaultRange").into()),
        };

        let mut queries = Vec::with_capacity(raw.queries.len());
        for (i, q) in raw.queries.into_iter().enumerate() {
            let scope = format!("Queries[{}]", i);
            let raw_query: RawQuerySpec = serde_json::from_value(q)
                .map_err(|e| ConfigError::new(scope.as_str(), e.to_string()))?;
            let spec = QuerySpec::try_from(raw_query).map_err(|e| scoped(e, &scope))?;
            queries.push(spec);
        }

        Ok(Self {
            kind,
            default_range,
            minimised: raw.minimised.unwrap_or(false),
            requested_range: raw.requested_range,
            queries,
            extra: raw.extra,
        })
    }
}

/// Parsed per-machine dashboard document.
#[derive(Debug, Clone, Default)]
pub struct DashboardDocument {
    /// Widgets keyed by slot number, iterated in slot order.
    pub widgets: BTreeMap<u8, WidgetConfig>,
    /// Node/sensor identifiers, passed through unchanged.
    pub sensor_list: Vec<Value>,
}

impl DashboardDocument {
    pub fn from_json(text: &str) -> Result<Self, DashboardError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ConfigError::new("", e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, DashboardError> {
        let Value::Object(map) = value else {
            return Err(ConfigError::new("", "document must be a JSON object").into());
        };

        let mut doc = DashboardDocument::default();
        for (key, value) in map {
            if key == SENSOR_LIST_KEY {
                doc.sensor_list = match value {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    _ => {
                        return Err(ConfigError::new(SENSOR_LIST_KEY, "must be an array").into());
                    }
                };
                continue;
            }

            match key.parse::<u8>() {
                Ok(slot) if WIDGET_SLOTS.contains(&slot) => {
                    let widget = WidgetConfig::from_value(value).map_err(|e| scoped(e, &key))?;
                    doc.widgets.insert(slot, widget);
                }
                _ => warn!(key = %key, "ignoring unknown document key"),
            }
        }

        if doc.sensor_list.is_empty() {
            debug!("document has no sensor list");
        }
        Ok(doc)
    }

    /// Reads and validates a `.json` document.
    pub fn from_path(path: &Path) -> Result<Self, DashboardError> {
        let shown = path.display().to_string();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return Err(ConfigError::new(shown, "document must be a .json file").into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::new(shown.as_str(), e.to_string()))?;
        Self::from_json(&text).map_err(|e| scoped(e, &shown))
    }

    /// Applies a caller-supplied custom range to every widget.
    ///
    /// A no-op when both bounds are `None`.
    pub fn inject_requested_range(&mut self, from: Option<&str>, to: Option<&str>) {
        if from.is_none() && to.is_none() {
            return;
        }
        debug!(?from, ?to, "injecting custom date range into widgets");
        for widget in self.widgets.values_mut() {
            widget.requested_range = Some(RequestedRange {
                start: from.map(str::to_string),
                end: to.map(str::to_string),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn sample() -> Value {
        json!({
            "SensorList": ["X-Axis", {"node": 4}],
            "1": {
                "Type": "Graph",
                "DefaultRange": "1h",
                "Minimised": false,
                "Title": "Spindle load",
                "Queries": [{"Bucket": "machines", "Measurement": "load", "Pivot": "sensor"}]
            },
            "2": {"Type": "Stat", "DefaultRange": "24h", "Minimised": true, "Queries": []},
            "10": {"Type": "Stat"},
            "Notes": "ignored"
        })
    }

    #[test]
    fn test_document_parses_slots_and_sensor_list() {
        let doc = DashboardDocument::from_value(sample()).unwrap();
        assert_eq!(doc.widgets.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(doc.sensor_list, vec![json!("X-Axis"), json!({"node": 4})]);

        let w = &doc.widgets[&1];
        assert_eq!(w.kind, WidgetKind::Graph);
        assert_eq!(w.default_range.to_string(), "1h");
        assert_eq!(w.queries.len(), 1);
        assert_eq!(w.extra.get("Title"), Some(&json!("Spindle load")));
        assert!(doc.widgets[&2].minimised);
    }

    #[test]
    fn test_widget_serializes_without_queries() {
        let doc = DashboardDocument::from_value(sample()).unwrap();
        let v = serde_json::to_value(&doc.widgets[&1]).unwrap();
        assert_eq!(
            v,
            json!({
                "Type": "Graph", "DefaultRange": "1h", "Minimised": false, "Title": "Spindle load"
            })
        );
    }

    #[test]
    fn test_errors_are_scoped_to_widget_and_query() {
        let err = DashboardDocument::from_value(json!({
            "3": {"Type": "Graph", "DefaultRange": "1h", "Queries": [{"Measurement": "m"}]}
        }))
        .unwrap_err();
        match err {
            DashboardError::Config(e) => assert_eq!(e.field, "3.Queries[0].Bucket"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_invalid_kind_and_range_rejected() {
        assert!(matches!(
            WidgetConfig::from_value(json!({"Type": "Table", "DefaultRange": "1h"})),
            Err(DashboardError::Config(_))
        ));
        assert!(matches!(
            WidgetConfig::from_value(json!({"Type": "Stat", "DefaultRange": "1y"})),
            Err(DashboardError::RangeFormat(_))
        ));
        assert!(matches!(
            WidgetConfig::from_value(json!({"Type": "Stat"})),
            Err(DashboardError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_limit_type_surfaces() {
        let err = DashboardDocument::from_value(json!({
            "1": {"Type": "Graph", "DefaultRange": "1h", "Queries": [
                {"Bucket": "b", "Measurement": "m", "Pivot": "p", "Limit": 2, "LimitType": "Top"}
            ]}
        }))
        .unwrap_err();
        assert_eq!(err, DashboardError::InvalidLimitType("Top".into()));
    }

    #[test]
    fn test_inject_requested_range() {
        let mut doc = DashboardDocument::from_value(sample()).unwrap();
        doc.inject_requested_range(None, None);
        assert!(doc.widgets.values().all(|w| w.requested_range.is_none()));

        doc.inject_requested_range(Some("2025-07-28T09:00"), Some("2025-07-28T10:00"));
        for w in doc.widgets.values() {
            let r = w.requested_range.as_ref().unwrap();
            assert_eq!(r.start.as_deref(), Some("2025-07-28T09:00"));
            assert_eq!(r.end.as_deref(), Some("2025-07-28T10:00"));
        }
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Hurco.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample().to_string().as_bytes()).unwrap();

        let doc = DashboardDocument::from_path(&path).unwrap();
        assert_eq!(doc.widgets.len(), 2);

        assert!(DashboardDocument::from_path(&dir.path().join("Hurco.txt")).is_err());
        assert!(DashboardDocument::from_path(&dir.path().join("Missing.json")).is_err());
    }

    #[test]
    fn test_non_object_document_rejected() {
        assert!(DashboardDocument::from_json("[1, 2]").is_err());
        assert!(DashboardDocument::from_json("{").is_err());
        assert!(DashboardDocument::from_json(r#"{"SensorList": 5}"#).is_err());
    }
}
