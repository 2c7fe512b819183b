//! Downsampling interval selection.
//!
//! Picks an `aggregateWindow` width so that a window renders in at most a
//! configured number of points. Two strategies:
//!
//! - duration-based: only the window length is known;
//! - decimation-based: the sensor's native cadence is known too, so a
//!   window that already fits the budget is left alone.
//!
//! Both snap the rough interval onto a candidate ladder, in seconds up to
//! 60 s and in minutes above.

use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;
use crate::util::TimeWindow;

/// Default point budget for full-size widgets.
pub const FULL_SCREEN_POINTS: u32 = 1500;
/// Default point budget for minimised widgets.
pub const MINIMISED_POINTS: u32 = 500;
/// Default interval ladder.
pub const DEFAULT_LADDER: [u32; 7] = [1, 2, 5, 10, 20, 30, 60];

/// Unit of an [`Interval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Seconds,
    Minutes,
}

impl IntervalUnit {
    pub fn suffix(self) -> &'static str {
        match self {
            IntervalUnit::Seconds => "s",
            IntervalUnit::Minutes => "m",
        }
    }
}

/// Aggregation window width, rendered as a Flux duration (`5s`, `2m`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub amount: u32,
    pub unit: IntervalUnit,
}

impl Interval {
    pub fn as_duration(&self) -> Duration {
        let secs = match self.unit {
            IntervalUnit::Seconds => u64::from(self.amount),
            IntervalUnit::Minutes => u64::from(self.amount) * 60,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.suffix())
    }
}

/// Outcome of the decimation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Downsample {
    /// Native density already fits the budget.
    NotNeeded,
    Window(Interval),
}

/// Point budgets and interval ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationConfig {
    full_points: u32,
    minimised_points: u32,
    ladder: Vec<u32>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            full_points: FULL_SCREEN_POINTS,
            minimised_points: MINIMISED_POINTS,
            ladder: DEFAULT_LADDER.to_vec(),
        }
    }
}

impl AggregationConfig {
    /// Budgets must be positive; the ladder non-empty and strictly ascending.
    pub fn new(
        full_points: u32,
        minimised_points: u32,
        ladder: Vec<u32>,
    ) -> Result<Self, ConfigError> {
        if full_points == 0 || minimised_points == 0 {
            return Err(ConfigError::new("points", "point budgets must be positive"));
        }
        if ladder.is_empty() || ladder[0] == 0 {
            return Err(ConfigError::new("ladder", "ladder must start above zero"));
        }
        if ladder.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::new("ladder", "ladder must be strictly ascending"));
        }
        Ok(Self {
            full_points,
            minimised_points,
            ladder,
        })
    }

    pub fn full_points(&self) -> u32 {
        self.full_points
    }

    pub fn minimised_points(&self) -> u32 {
        self.minimised_points
    }

    pub fn ladder(&self) -> &[u32] {
        &self.ladder
    }

    /// Point budget for a widget's display mode.
    pub fn points_budget(&self, minimised: bool) -> u32 {
        if minimised {
            self.minimised_points
        } else {
            self.full_points
        }
    }

    /// Duration-based strategy.
    pub fn select_for_duration(&self, duration_secs: f64, max_points: u32) -> Interval {
        let rough = duration_secs.max(0.0) / f64::from(max_points.max(1));
        self.snap(rough)
    }

    /// Decimation-based strategy.
    pub fn select_for_samples(
        &self,
        window: &TimeWindow,
        native: Duration,
        max_points: u32,
    ) -> Downsample {
        let native_secs = native.as_secs_f64();
        if native_secs <= 0.0 {
            return Downsample::Window(self.select_for_duration(window.duration_secs(), max_points));
        }
        let max_points = f64::from(max_points.max(1));
        let estimated = window.duration_secs() / native_secs;
        if estimated < max_points {
            return Downsample::NotNeeded;
        }
        let factor = estimated / max_points;
        Downsample::Window(self.snap(factor * native_secs))
    }

    /// Snaps a rough interval in seconds onto the ladder.
    fn snap(&self, rough_secs: f64) -> Interval {
        let (rough, unit) = if rough_secs > 60.0 {
            (rough_secs / 60.0, IntervalUnit::Minutes)
        } else {
            (rough_secs, IntervalUnit::Seconds)
        };
        let amount = self
            .ladder
            .iter()
            .copied()
            .find(|&c| f64::from(c) >= rough)
            .or_else(|| self.ladder.last().copied())
            .unwrap_or(1);
        Interval { amount, unit }
    }
}
