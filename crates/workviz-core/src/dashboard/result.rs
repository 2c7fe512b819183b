use std::time::Duration;

use chrono_tz::Tz;
use serde::ser::{Error as _, SerializeSeq, SerializeStruct};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::config::WidgetConfig;
use crate::table::{SeriesTable, TIME_COLUMN};

/// Outcome of one widget: one slot per configured query.
#[derive(Debug, Clone)]
pub struct WidgetResult {
    pub id: u8,
    pub config: WidgetConfig,
    /// Distinct series names across all non-null slots, first-seen order.
    pub series: Vec<String>,
    /// `None` where the query failed, timed out or matched nothing.
    pub data: Vec<Option<SeriesTable>>,
    pub execution_time: Duration,
    /// Zone used to format row timestamps.
    pub timezone: Tz,
}

impl WidgetResult {
    /// Series names in first-seen order, without duplicates.
    pub(crate) fn derive_series(data: &[Option<SeriesTable>]) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for table in data.iter().flatten().filter(|t| !t.is_empty()) {
            for name in table.names() {
                if name != TIME_COLUMN && !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        names
    }

    fn records(&self) -> Vec<Option<Vec<Map<String, Value>>>> {
        self.data
            .iter()
            .map(|slot| slot.as_ref().map(|t| t.to_records(self.timezone)))
            .collect()
    }
}

impl Serialize for WidgetResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut config = serde_json::to_value(&self.config).map_err(S::Error::custom)?;
        if let Value::Object(map) = &mut config {
            map.insert("Series".to_string(), Value::from(self.series.clone()));
        }

        let mut s = serializer.serialize_struct("WidgetResult", 3)?;
        s.serialize_field("config", &config)?;
        s.serialize_field("data", &self.records())?;
        s.serialize_field("ExecutionTime", &self.execution_time.as_secs_f64())?;
        s.end()
    }
}

/// All widgets of a dashboard in slot order, plus the sensor list.
///
/// Serializes to the response envelope: one object per widget followed by
/// a trailing `{"sensor_list": [...]}` entry.
#[derive(Debug, Clone, Default)]
pub struct DashboardResult {
    pub widgets: Vec<WidgetResult>,
    pub sensor_list: Vec<Value>,
}

#[derive(Serialize)]
struct SensorListEntry<'a> {
    sensor_list: &'a [Value],
}

impl Serialize for DashboardResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.widgets.len() + 1))?;
        for widget in &self.widgets {
            seq.serialize_element(widget)?;
        }
        seq.serialize_element(&SensorListEntry {
            sensor_list: &self.sensor_list,
        })?;
        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{RawRecord, RawTable};
    use crate::table::reshape;
    use chrono::{TimeZone, Utc};
    use chrono_tz::Europe::London;
    use serde_json::json;

    fn table(sensors: &[&str]) -> SeriesTable {
        let t0 = Utc.with_ymd_and_hms(2025, 7, 28, 11, 15, 0).single().unwrap();
        let records = sensors
            .iter()
            .enumerate()
            .map(|(i, s)| RawRecord::new(t0, i as f64).with_tag("sensor", *s))
            .collect();
        reshape(&[RawTable::new(records)], Some("sensor")).unwrap()
    }

    fn widget(data: Vec<Option<SeriesTable>>) -> WidgetResult {
        let config = WidgetConfig::from_value(json!({
            "Type": "Graph", "DefaultRange": "1h", "Minimised": false, "Title": "Load",
            "Queries": [{"Bucket": "b", "Measurement": "m"}]
        }))
        .unwrap();
        WidgetResult {
            id: 1,
            config,
            series: WidgetResult::derive_series(&data),
            data,
            execution_time: Duration::from_millis(1500),
            timezone: London,
        }
    }

    #[test]
    fn test_series_names_deduplicated_in_order() {
        let data = vec![Some(table(&["B", "A"])), None, Some(table(&["A", "C"]))];
        assert_eq!(WidgetResult::derive_series(&data), vec!["B", "A", "C"]);
        assert!(WidgetResult::derive_series(&[None, None]).is_empty());
    }

    #[test]
    fn test_widget_envelope() {
        let v = serde_json::to_value(widget(vec![Some(table(&["A"])), None])).unwrap();
        assert_eq!(
            v,
            json!({
                "config": {
                    "Type": "Graph", "DefaultRange": "1h", "Minimised": false,
                    "Title": "Load", "Series": ["A"]
                },
                "data": [[{"time": "12:15", "A": 0.0}], null],
                "ExecutionTime": 1.5
            })
        );
    }

    #[test]
    fn test_dashboard_envelope_ends_with_sensor_list() {
        let result = DashboardResult {
            widgets: vec![widget(vec![None])],
            sensor_list: vec![json!("X-Axis"), json!("Spindle")],
        };
        let v = serde_json::to_value(&result).unwrap();
        let items = v.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["data"], json!([null]));
        assert_eq!(items[0]["config"]["Series"], json!([]));
        assert_eq!(items[1], json!({"sensor_list": ["X-Axis", "Spindle"]}));

        let empty = serde_json::to_value(DashboardResult::default()).unwrap();
        assert_eq!(empty, json!([{"sensor_list": []}]));
    }
}
