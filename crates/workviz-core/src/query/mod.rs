//! Flux query AST.
//!
//! Queries are assembled as a typed pipeline and only turned into text at
//! the end, through `Display`. Every user-controlled value goes through one
//! of the literal encoders below, so document values can never change the
//! shape of the emitted query.

mod builder;

pub use builder::build_query;

use std::fmt;

use chrono::SecondsFormat;
use regex::Regex;

use crate::aggregation::Interval;
use crate::config::{AggregateFn, ScaleExpr};
use crate::util::TimeWindow;

/// Column a filter clause tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    Measurement,
    Field,
    Tag(String),
}

impl Column {
    fn name(&self) -> &str {
        match self {
            Column::Measurement => "_measurement",
            Column::Field => "_field",
            Column::Tag(key) => key,
        }
    }
}

/// Single comparison inside a filter.
#[derive(Debug, Clone)]
pub enum Clause {
    Equals { column: Column, value: String },
    Matches { column: Column, pattern: Regex },
}

impl PartialEq for Clause {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Clause::Equals { column: a, value: x },
                Clause::Equals { column: b, value: y },
            ) => a == b && x == y,
            (
                Clause::Matches { column: a, pattern: x },
                Clause::Matches { column: b, pattern: y },
            ) => a == b && x.as_str() == y.as_str(),
            _ => false,
        }
    }
}

/// Pipeline stage after `range()`.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Clauses are OR-ed; consecutive filters are AND-ed.
    Filter(Vec<Clause>),
    AggregateWindow { every: Interval, func: AggregateFn },
    Last,
    Scale(ScaleExpr),
}

/// `from(bucket) |> range(window) |> stages...`
#[derive(Debug, Clone, PartialEq)]
pub struct FluxQuery {
    bucket: String,
    window: TimeWindow,
    stages: Vec<Stage>,
}

impl FluxQuery {
    pub fn new(bucket: impl Into<String>, window: TimeWindow) -> Self {
        Self {
            bucket: bucket.into(),
            window,
            stages: Vec::new(),
        }
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// First `_measurement` equality, if any.
    pub fn measurement(&self) -> Option<&str> {
        self.stages.iter().find_map(|stage| match stage {
            Stage::Filter(clauses) => clauses.iter().find_map(|c| match c {
                Clause::Equals {
                    column: Column::Measurement,
                    value,
                } => Some(value.as_str()),
                _ => None,
            }),
            _ => None,
        })
    }
}

impl fmt::Display for FluxQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "from(bucket: {})", flux_string(&self.bucket))?;
        write!(
            f,
            "  |> range(start: {}, stop: {})",
            self.window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.window.end.to_rfc3339_opts(SecondsFormat::Secs, true)
        )?;
        for stage in &self.stages {
            write!(f, "\n  |> {}", stage)?;
        }
        Ok(())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Filter(clauses) => {
                write!(f, "filter(fn: (r) => ")?;
                for (i, clause) in clauses.iter().enumerate() {
                    if i > 0 {
                        write!(f, " or ")?;
                    }
                    write!(f, "{}", clause)?;
                }
                write!(f, ")")
            }
            Stage::AggregateWindow { every, func } => write!(
                f,
                "aggregateWindow(every: {}, fn: {}, createEmpty: false)",
                every,
                func.flux_name()
            ),
            Stage::Last => write!(f, "last()"),
            Stage::Scale(scale) => write!(
                f,
                "map(fn: (r) => ({{r with _value: float(v: r._value) {} {}}}))",
                scale.op.symbol(),
                flux_float(scale.operand)
            ),
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Equals { column, value } => write!(
                f,
                "r[{}] == {}",
                flux_string(column.name()),
                flux_string(value)
            ),
            Clause::Matches { column, pattern } => write!(
                f,
                "r[{}] =~ {}",
                flux_string(column.name()),
                flux_regex(pattern.as_str())
            ),
        }
    }
}

/// Double-quoted Flux string literal.
pub fn flux_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            // `${` starts interpolation
            '$' => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("\\x{:02x}", b));
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Slash-delimited Flux regex literal.
pub fn flux_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('/');
    let mut escaped = false;
    for c in pattern.chars() {
        match c {
            '/' if !escaped => out.push_str("\\/"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
        escaped = c == '\\' && !escaped;
    }
    out.push('/');
    out
}

/// Float literal; Flux refuses `int * float`, so a `.` is always present.
pub fn flux_float(value: f64) -> String {
    let s = value.to_string();
    if s.contains('.') || !value.is_finite() {
        s
    } else {
        format!("{}.0", s)
    }
}
