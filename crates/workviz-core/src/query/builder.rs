use tracing::debug;

use super::{Clause, Column, FluxQuery, Stage};
use crate::aggregation::{AggregationConfig, Downsample};
use crate::config::{PredicateValue, QuerySpec, WidgetKind};
use crate::error::{ConfigError, DashboardError};
use crate::util::TimeWindow;

/// Builds the Flux pipeline for one query of a widget.
///
/// Stage order: measurement/field selection, tag predicates, summarised
/// field, series allow-list, then `last()` for minimised stats or an
/// `aggregateWindow` when the window holds more points than the display
/// budget, and finally the scale `map()`. The time bounds are carried by
/// the query itself and rendered as `range()` right after `from()`.
pub fn build_query(
    spec: &QuerySpec,
    window: TimeWindow,
    kind: WidgetKind,
    minimised: bool,
    aggregation: &AggregationConfig,
) -> Result<FluxQuery, DashboardError> {
    if spec.bucket.trim().is_empty() {
        return Err(ConfigError::missing("Bucket").into());
    }
    if spec.measurement.trim().is_empty() {
        return Err(ConfigError::missing("Measurement").into());
    }

    let mut query = FluxQuery::new(spec.bucket.as_str(), window);
    query.push(Stage::Filter(vec![Clause::Equals {
        column: Column::Measurement,
        value: spec.measurement.clone(),
    }]));
    if let Some(field) = &spec.field {
        query.push(Stage::Filter(vec![Clause::Equals {
            column: Column::Field,
            value: field.clone(),
        }]));
    }

    for predicate in &spec.predicates {
        let clauses = predicate
            .values
            .iter()
            .map(|value| {
                let column = Column::Tag(predicate.key.clone());
                match value {
                    PredicateValue::Literal(v) => Clause::Equals {
                        column,
                        value: v.clone(),
                    },
                    PredicateValue::Regex(re) => Clause::Matches {
                        column,
                        pattern: re.clone(),
                    },
                }
            })
            .collect();
        query.push(Stage::Filter(clauses));
    }

    if spec.summarised {
        query.push(Stage::Filter(vec![Clause::Equals {
            column: Column::Field,
            value: spec.function.summary_field().to_string(),
        }]));
    }

    if let (Some(series), Some(pivot)) = (&spec.series, &spec.pivot) {
        let clauses = series
            .iter()
            .map(|name| Clause::Equals {
                column: Column::Tag(pivot.clone()),
                value: name.clone(),
            })
            .collect();
        query.push(Stage::Filter(clauses));
    }

    if kind == WidgetKind::Stat && minimised {
        query.push(Stage::Last);
    } else {
        let budget = aggregation.points_budget(minimised);
        let downsample = match spec.sample_interval {
            Some(native) => aggregation.select_for_samples(&window, native, budget),
            None => {
                Downsample::Window(aggregation.select_for_duration(window.duration_secs(), budget))
            }
        };
        match downsample {
            Downsample::Window(every) => query.push(Stage::AggregateWindow {
                every,
                func: spec.function,
            }),
            Downsample::NotNeeded => {
                debug!(
                    measurement = %spec.measurement,
                    budget,
                    "native density fits, no aggregation"
                )
            }
        }
    }

    if let Some(scale) = spec.scale {
        query.push(Stage::Scale(scale));
    }

    Ok(query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{Interval, IntervalUnit};
    use crate::config::{AggregateFn, Predicate, ScaleExpr, ScaleOp};
    use chrono::{TimeZone, Utc};
    use regex::Regex;
    use std::time::Duration;

    fn hour() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2025, 7, 28, 10, 0, 0).single().unwrap(),
            Utc.with_ymd_and_hms(2025, 7, 28, 11, 0, 0).single().unwrap(),
        )
        .unwrap()
    }

    fn spec() -> QuerySpec {
        QuerySpec {
            bucket: "machines".into(),
            measurement: "load".into(),
            field: None,
            pivot: None,
            predicates: Vec::new(),
            series: None,
            scale: None,
            function: AggregateFn::Mean,
            summarised: false,
            sample_interval: None,
            limit: None,
        }
    }

    fn build(spec: &QuerySpec, kind: WidgetKind, minimised: bool) -> FluxQuery {
        build_query(spec, hour(), kind, minimised, &AggregationConfig::default()).unwrap()
    }

    #[test]
    fn test_graph_hour_uses_five_second_window() {
        let q = build(&spec(), WidgetKind::Graph, false);
        assert_eq!(q.bucket(), "machines");
        assert_eq!(
            q.stages().last(),
            Some(&Stage::AggregateWindow {
                every: Interval { amount: 5, unit: IntervalUnit::Seconds },
                func: AggregateFn::Mean,
            })
        );
        assert!(q.to_string().contains("aggregateWindow(every: 5s, fn: mean, createEmpty: false)"));
    }

    #[test]
    fn test_minimised_graph_uses_smaller_budget() {
        // 3600 / 500 = 7.2s -> 10s
        let q = build(&spec(), WidgetKind::Graph, true);
        assert!(q.to_string().contains("every: 10s"));
    }

    #[test]
    fn test_minimised_stat_takes_last() {
        let q = build(&spec(), WidgetKind::Stat, true);
        assert_eq!(q.stages().last(), Some(&Stage::Last));
        assert!(!q.to_string().contains("aggregateWindow"));

        let q = build(&spec(), WidgetKind::Stat, false);
        assert!(q.to_string().contains("aggregateWindow"));
    }

    #[test]
    fn test_native_interval_can_skip_aggregation() {
        let mut s = spec();
        s.sample_interval = Some(Duration::from_secs(10));
        let q = build(&s, WidgetKind::Graph, false);
        assert!(!q.stages().iter().any(|st| matches!(st, Stage::AggregateWindow { .. })));

        s.sample_interval = Some(Duration::from_millis(100));
        let q = build(&s, WidgetKind::Graph, false);
        // 36000 points, factor 24 -> 2.4s -> 5s
        assert!(q.to_string().contains("every: 5s"));
    }

    #[test]
    fn test_predicates_regex_only_for_slashed_values() {
        let mut s = spec();
        s.predicates = vec![
            Predicate {
                key: "axis".into(),
                values: vec![
                    PredicateValue::Literal("X".into()),
                    PredicateValue::Regex(Regex::new("^Y/Z").unwrap()),
                ],
            },
            Predicate {
                key: "machine".into(),
                values: vec![PredicateValue::Literal("Hurco".into())],
            },
        ];
        let text = build(&s, WidgetKind::Graph, false).to_string();
        assert!(text.contains(
            "filter(fn: (r) => r[\"axis\"] == \"X\" or r[\"axis\"] =~ /^Y\\/Z/)"
        ));
        assert!(text.contains("filter(fn: (r) => r[\"machine\"] == \"Hurco\")"));
    }

    #[test]
    fn test_field_summarised_and_series() {
        let mut s = spec();
        s.field = Some("current".into());
        s.summarised = true;
        s.function = AggregateFn::Max;
        s.pivot = Some("sensor".into());
        s.series = Some(vec!["A".into(), "B".into()]);
        let text = build(&s, WidgetKind::Graph, false).to_string();

        let field = text.find("r[\"_field\"] == \"current\"").unwrap();
        let summary = text.find("r[\"_field\"] == \"Max\"").unwrap();
        let series = text.find("r[\"sensor\"] == \"A\" or r[\"sensor\"] == \"B\"").unwrap();
        let agg = text.find("fn: max").unwrap();
        assert!(field < summary && summary < series && series < agg);
    }

    #[test]
    fn test_scale_is_last_stage() {
        let mut s = spec();
        s.scale = Some(ScaleExpr { op: ScaleOp::Div, operand: 1000.0 });
        let q = build(&s, WidgetKind::Graph, false);
        let per_thousand = ScaleExpr {
            op: ScaleOp::Div,
            operand: 1000.0,
        };
        assert_eq!(q.stages().last(), Some(&Stage::Scale(per_thousand)));
        assert!(q.to_string().ends_with("float(v: r._value) / 1000.0}))"));
    }

    #[test]
    fn test_escapes_document_values() {
        let mut s = spec();
        s.measurement = "lo\"ad$".into();
        let text = build(&s, WidgetKind::Graph, false).to_string();
        assert!(text.contains("r[\"_measurement\"] == \"lo\\\"ad\\$\""));
    }

    #[test]
    fn test_missing_bucket_or_measurement() {
        let mut s = spec();
        s.bucket = String::new();
        let err = build_query(&s, hour(), WidgetKind::Graph, false, &AggregationConfig::default())
            .unwrap_err();
        assert!(matches!(err, DashboardError::Config(ref e) if e.field == "Bucket"));

        let mut s = spec();
        s.measurement = " ".into();
        let aggregation = AggregationConfig::default();
        assert!(build_query(&s, hour(), WidgetKind::Graph, false, &aggregation).is_err());
    }
}
