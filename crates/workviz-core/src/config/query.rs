//! Per-query configuration: the `Queries` entries of a widget.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ConfigError, DashboardError};

/// Aggregation function applied inside `aggregateWindow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    #[default]
    Mean,
    Median,
    Max,
    Min,
    Sum,
    Count,
    First,
    Last,
    Spread,
    Stddev,
}

impl AggregateFn {
    /// Flux function name (`mean`, `max`, ...).
    pub fn flux_name(self) -> &'static str {
        match self {
            AggregateFn::Mean => "mean",
            AggregateFn::Median => "median",
            AggregateFn::Max => "max",
            AggregateFn::Min => "min",
            AggregateFn::Sum => "sum",
            AggregateFn::Count => "count",
            AggregateFn::First => "first",
            AggregateFn::Last => "last",
            AggregateFn::Spread => "spread",
            AggregateFn::Stddev => "stddev",
        }
    }

    /// Capitalized name used as the `_field` of pre-summarised series.
    pub fn summary_field(self) -> &'static str {
        match self {
            AggregateFn::Mean => "Mean",
            AggregateFn::Median => "Median",
            AggregateFn::Max => "Max",
            AggregateFn::Min => "Min",
            AggregateFn::Sum => "Sum",
            AggregateFn::Count => "Count",
            AggregateFn::First => "First",
            AggregateFn::Last => "Last",
            AggregateFn::Spread => "Spread",
            AggregateFn::Stddev => "Stddev",
        }
    }
}

/// Top-N selector for the series reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LimitType {
    Max,
    Min,
}

impl FromStr for LimitType {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Max" => Ok(LimitType::Max),
            "Min" => Ok(LimitType::Min),
            other => Err(DashboardError::InvalidLimitType(other.to_string())),
        }
    }
}

/// Keep only the `count` most extreme series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesLimit {
    pub count: usize,
    pub selector: LimitType,
}

/// One allowed value of a predicate key.
#[derive(Debug, Clone)]
pub enum PredicateValue {
    Literal(String),
    /// Pattern without the surrounding slashes; compiled at load time.
    Regex(Regex),
}

impl PredicateValue {
    /// `/…/` becomes a regex, everything else a literal.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        if raw.len() >= 2 && raw.starts_with('/') && raw.ends_with('/') {
            let pattern = &raw[1..raw.len() - 1];
            let re = Regex::new(pattern)
                .map_err(|e| ConfigError::new("", format!("invalid regex {}: {}", raw, e)))?;
            Ok(PredicateValue::Regex(re))
        } else {
            Ok(PredicateValue::Literal(raw.to_string()))
        }
    }
}

impl PartialEq for PredicateValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PredicateValue::Literal(a), PredicateValue::Literal(b)) => a == b,
            (PredicateValue::Regex(a), PredicateValue::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

/// Tag predicate: the tag must match ANY of `values`.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub key: String,
    pub values: Vec<PredicateValue>,
}

/// Arithmetic operator of a scale expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleOp {
    Mul,
    Div,
    Add,
    Sub,
}

impl ScaleOp {
    pub fn symbol(self) -> char {
        match self {
            ScaleOp::Mul => '*',
            ScaleOp::Div => '/',
            ScaleOp::Add => '+',
            ScaleOp::Sub => '-',
        }
    }
}

/// Post-aggregation value transform, written `"<op> <number>"` (e.g. `"* 1000"`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleExpr {
    pub op: ScaleOp,
    pub operand: f64,
}

impl ScaleExpr {
    pub fn apply(&self, value: f64) -> f64 {
        match self.op {
            ScaleOp::Mul => value * self.operand,
            ScaleOp::Div => value / self.operand,
            ScaleOp::Add => value + self.operand,
            ScaleOp::Sub => value - self.operand,
        }
    }
}

impl FromStr for ScaleExpr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        let op = match chars.next() {
            Some('*') => ScaleOp::Mul,
            Some('/') => ScaleOp::Div,
            Some('+') => ScaleOp::Add,
            Some('-') => ScaleOp::Sub,
            _ => {
                return Err(ConfigError::new(
                    "",
                    format!("scale '{}' must start with one of * / + -", s),
                ));
            }
        };
        let operand: f64 = chars
            .as_str()
            .trim()
            .parse()
            .map_err(|_| ConfigError::new("", format!("scale '{}' has no numeric operand", s)))?;
        if !operand.is_finite() {
            return Err(ConfigError::new("", format!("scale '{}' is not finite", s)));
        }
        if op == ScaleOp::Div && operand == 0.0 {
            return Err(ConfigError::new("", "scale divides by zero"));
        }
        Ok(Self { op, operand })
    }
}

impl fmt::Display for ScaleExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.symbol(), self.operand)
    }
}

/// Validated query specification.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub bucket: String,
    pub measurement: String,
    /// Equality filter on `_field`.
    pub field: Option<String>,
    /// Tag whose values become separate series.
    pub pivot: Option<String>,
    /// Sorted by key; combined with AND.
    pub predicates: Vec<Predicate>,
    /// Allow-list of pivot values.
    pub series: Option<Vec<String>>,
    pub scale: Option<ScaleExpr>,
    pub function: AggregateFn,
    /// Select the pre-summarised field named after `function`.
    pub summarised: bool,
    /// Native sensor cadence.
    pub sample_interval: Option<Duration>,
    pub limit: Option<SeriesLimit>,
}

/// Predicate values as written: a single string or a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPredicate {
    One(String),
    Many(Vec<String>),
}

/// `Pivot` accepts a tag name, `false` or `null`.
fn pivot_key<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPivot {
        Key(String),
        #[allow(dead_code)]
        Flag(bool),
    }

    Ok(match Option::<RawPivot>::deserialize(deserializer)? {
        Some(RawPivot::Key(k)) if !k.trim().is_empty() => Some(k),
        _ => None,
    })
}

/// Query object exactly as it appears in the document.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct RawQuerySpec {
    bucket: Option<String>,
    measurement: Option<String>,
    field: Option<String>,
    #[serde(default, deserialize_with = "pivot_key")]
    pivot: Option<String>,
    #[serde(default)]
    filters: BTreeMap<String, RawPredicate>,
    series: Option<Vec<String>>,
    scale: Option<String>,
    function: Option<AggregateFn>,
    #[serde(default)]
    summarised: bool,
    sample_interval: Option<f64>,
    limit: Option<i64>,
    limit_type: Option<String>,
}

fn required(value: Option<String>, field: &str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::missing(field)),
    }
}

impl TryFrom<RawQuerySpec> for QuerySpec {
    type Error = DashboardError;

    fn try_from(raw: RawQuerySpec) -> Result<Self, Self::Error> {
        let bucket = required(raw.bucket, "Bucket")?;
        let measurement = required(raw.measurement, "Measurement")?;

        let mut predicates = Vec::with_capacity(raw.filters.len());
        for (key, value) in raw.filters {
            let scope = format!("Filters.{}", key);
            let raw_values = match value {
                RawPredicate::One(v) => vec![v],
                RawPredicate::Many(vs) => vs,
            };
            if raw_values.is_empty() {
                return Err(ConfigError::new(scope, "predicate needs at least one value").into());
            }
            let values = raw_values
                .iter()
                .map(|v| PredicateValue::parse(v).map_err(|e| e.within(&scope)))
                .collect::<Result<Vec<_>, _>>()?;
            predicates.push(Predicate { key, values });
        }

        if raw.series.is_some() && raw.pivot.is_none() {
            return Err(ConfigError::new("Series", "series allow-list requires Pivot").into());
        }
        if raw.series.as_ref().is_some_and(|s| s.is_empty()) {
            return Err(ConfigError::new("Series", "series allow-list is empty").into());
        }

        let scale = raw
            .scale
            .as_deref()
            .map(|s| s.parse::<ScaleExpr>().map_err(|e| e.within("Scale")))
            .transpose()?;

        let sample_interval = match raw.sample_interval {
            Some(secs) if secs > 0.0 => match Duration::try_from_secs_f64(secs) {
                Ok(interval) => Some(interval),
                Err(e) => {
                    return Err(ConfigError::new(
                        "SampleInterval",
                        format!("{} seconds is out of range: {}", secs, e),
                    )
                    .into());
                }
            },
            Some(secs) => {
                return Err(ConfigError::new(
                    "SampleInterval",
                    format!("must be a positive number of seconds, got {}", secs),
                )
                .into());
            }
            None => None,
        };

        let limit = match (raw.limit, raw.limit_type) {
            (None, _) => None,
            (Some(n), _) if n < 1 => {
                return Err(ConfigError::new("Limit", format!("must be >= 1, got {}", n)).into());
            }
            (Some(_), None) => return Err(DashboardError::InvalidLimitType(String::new())),
            (Some(n), Some(t)) => Some(SeriesLimit {
                count: n as usize,
                selector: t.parse()?,
            }),
        };

        Ok(QuerySpec {
            bucket,
            measurement,
            field: raw.field.filter(|f| !f.trim().is_empty()),
            pivot: raw.pivot,
            predicates,
            series: raw.series,
            scale,
            function: raw.function.unwrap_or_default(),
            summarised: raw.summarised,
            sample_interval,
            limit,
        })
    }
}
