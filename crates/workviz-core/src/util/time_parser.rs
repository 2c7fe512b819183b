//! Time range resolution for dashboard widgets.
//!
//! Supports two inputs:
//! - Relative range token: `30s`, `15m`, `1h`, `7d`, `2w`, `3M` (M = 30 days)
//! - Explicit bounds in the reference timezone:
//!   `2025-07-28T11:15`, `2025-07-28T11:15:00`, `2025-07-28T11:15:00Z`
//!
//! Explicit bounds are always naive local times in the reference timezone
//! (the facility's zone), including the `Z`-suffixed form. They are
//! localized through the tz database and converted to UTC before any query
//! sees them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::config::RequestedRange;
use crate::error::RangeFormatError;

/// Accepted explicit-bound formats, tried in order.
const EXPLICIT_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"];

/// Upper bound for relative ranges (200,000 years). Windows ending at any
/// present-day instant stay inside chrono's representable range.
const MAX_RANGE_SECS: i64 = 200_000 * 365 * 86_400;

/// UTC time window `start..end` rendered into `range()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, RangeFormatError> {
        if end < start {
            return Err(RangeFormatError::new(
                &format!("{}..{}", start.to_rfc3339(), end.to_rfc3339()),
                "end is before start",
            ));
        }
        Ok(Self { start, end })
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Window length in fractional seconds.
    pub fn duration_secs(&self) -> f64 {
        self.duration().num_milliseconds() as f64 / 1000.0
    }
}

/// Unit of a relative range token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    /// Fixed 30-day month.
    Months,
}

impl RangeUnit {
    fn from_char(c: char) -> Option<Self> {
        match c {
            's' => Some(RangeUnit::Seconds),
            'm' => Some(RangeUnit::Minutes),
            'h' => Some(RangeUnit::Hours),
            'd' => Some(RangeUnit::Days),
            'w' => Some(RangeUnit::Weeks),
            'M' => Some(RangeUnit::Months),
            _ => None,
        }
    }

    fn as_char(self) -> char {
        match self {
            RangeUnit::Seconds => 's',
            RangeUnit::Minutes => 'm',
            RangeUnit::Hours => 'h',
            RangeUnit::Days => 'd',
            RangeUnit::Weeks => 'w',
            RangeUnit::Months => 'M',
        }
    }

    fn seconds(self) -> i64 {
        match self {
            RangeUnit::Seconds => 1,
            RangeUnit::Minutes => 60,
            RangeUnit::Hours => 3_600,
            RangeUnit::Days => 86_400,
            RangeUnit::Weeks => 604_800,
            RangeUnit::Months => 30 * 86_400,
        }
    }
}

/// Relative range token such as `1h` or `7d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeRange {
    amount: u32,
    unit: RangeUnit,
}

impl RelativeRange {
    /// Parses `"<digits><unit>"`. Unknown units are rejected.
    pub fn parse(token: &str) -> Result<Self, RangeFormatError> {
        let unit_char = token
            .chars()
            .last()
            .ok_or_else(|| RangeFormatError::new(token, "empty range"))?;
        let digits = &token[..token.len() - unit_char.len_utf8()];

        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(RangeFormatError::new(
                token,
                "expected format like '1h', '7d' or '30m'",
            ));
        }

        let unit = RangeUnit::from_char(unit_char).ok_or_else(|| {
            RangeFormatError::new(token, format!("unknown time unit '{}'", unit_char))
        })?;

        let amount: u32 = digits
            .parse()
            .map_err(|_| RangeFormatError::new(token, "amount out of range"))?;

        if i64::from(amount) * unit.seconds() > MAX_RANGE_SECS {
            return Err(RangeFormatError::new(token, "range too large"));
        }

        Ok(Self { amount, unit })
    }

    pub fn duration(&self) -> TimeDelta {
        TimeDelta::seconds(i64::from(self.amount) * self.unit.seconds())
    }

    /// Window of this length ending at `end`.
    pub fn window_ending(&self, end: DateTime<Utc>) -> TimeWindow {
        TimeWindow {
            start: end
                .checked_sub_signed(self.duration())
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            end,
        }
    }
}

impl fmt::Display for RelativeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.as_char())
    }
}

impl FromStr for RelativeRange {
    type Err = RangeFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parses a naive local datetime in `tz` and converts it to UTC.
///
/// Ambiguous local times (autumn fold) resolve to the earlier instant.
/// Local times inside a spring-forward gap are shifted forward one hour.
pub fn parse_local_datetime(input: &str, tz: Tz) -> Result<DateTime<Utc>, RangeFormatError> {
    let input = input.trim();
    let naive = EXPLICIT_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .ok_or_else(|| {
            RangeFormatError::new(
                input,
                "expected YYYY-MM-DDTHH:MM, YYYY-MM-DDTHH:MM:SS or YYYY-MM-DDTHH:MM:SSZ",
            )
        })?;

    let local = tz
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(naive + TimeDelta::hours(1)))
                .earliest()
        })
        .ok_or_else(|| RangeFormatError::new(input, format!("not a valid local time in {}", tz)))?;

    Ok(local.with_timezone(&Utc))
}

/// Parses an explicit `{start, end}` pair given in `tz`.
pub fn parse_explicit_window(
    start: &str,
    end: &str,
    tz: Tz,
) -> Result<TimeWindow, RangeFormatError> {
    let start = parse_local_datetime(start, tz)?;
    let end = parse_local_datetime(end, tz)?;
    TimeWindow::new(start, end)
}

fn try_requested(
    requested: Option<&RequestedRange>,
    tz: Tz,
) -> Option<Result<TimeWindow, RangeFormatError>> {
    let requested = requested?;
    match (requested.start.as_deref(), requested.end.as_deref()) {
        (Some(start), Some(end)) => Some(parse_explicit_window(start, end, tz)),
        (None, None) => None,
        (start, end) => Some(Err(RangeFormatError::new(
            start.or(end).unwrap_or_default(),
            "requested range needs both start and end",
        ))),
    }
}

/// Resolves a widget's time window.
///
/// An explicit requested range wins when it parses. Any `RangeFormatError`
/// on the explicit path falls back to `default` ending at `now`, with a
/// warning.
pub fn resolve_window(
    default: &RelativeRange,
    requested: Option<&RequestedRange>,
    tz: Tz,
    now: DateTime<Utc>,
) -> TimeWindow {
    match try_requested(requested, tz) {
        Some(Ok(window)) => window,
        Some(Err(e)) => {
            warn!(error = %e, fallback = %default, "requested range rejected, using default range");
            default.window_ending(now)
        }
        None => default.window_ending(now),
    }
}

/// Like [`resolve_window`] but with an unvalidated default token.
///
/// Fails only when the explicit pair is absent or unparseable AND the
/// default token is invalid.
pub fn resolve_range(
    default_token: &str,
    requested: Option<&RequestedRange>,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<TimeWindow, RangeFormatError> {
    match try_requested(requested, tz) {
        Some(Ok(window)) => return Ok(window),
        Some(Err(e)) => {
            warn!(
                error = %e,
                fallback = default_token,
                "requested range rejected, using default range"
            );
        }
        None => {}
    }
    Ok(RelativeRange::parse(default_token)?.window_ending(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::London;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single().unwrap()
    }

    fn requested(start: &str, end: &str) -> RequestedRange {
        RequestedRange {
            start: Some(start.to_string()),
            end: Some(end.to_string()),
        }
    }

    #[test]
    fn test_relative_range_exact_offsets() {
        let now = utc(2025, 7, 28, 12, 0, 0);
        let cases = [
            ("45s", 45),
            ("2h", 7_200),
            ("15m", 900),
            ("7d", 604_800),
            ("1w", 604_800),
            ("1M", 2_592_000),
            ("0h", 0),
        ];
        for (token, secs) in cases {
            let window = RelativeRange::parse(token).unwrap().window_ending(now);
            assert_eq!(window.end, now, "{token}");
            assert_eq!(window.duration().num_seconds(), secs, "{token}");
        }
    }

    #[test]
    fn test_relative_range_display_round_trip() {
        for token in ["1h", "30m", "3M", "120s"] {
            assert_eq!(RelativeRange::parse(token).unwrap().to_string(), token);
        }
    }

    #[test]
    fn test_unknown_unit_is_error() {
        let err = RelativeRange::parse("5y").unwrap_err();
        assert!(err.message.contains("unknown time unit"));
        assert!(RelativeRange::parse("5H").is_err());
    }

    #[test]
    fn test_invalid_relative_tokens() {
        for token in ["", "h", "1", "-1h", "1.5h", " 1h", "abc", "1hh"] {
            assert!(RelativeRange::parse(token).is_err(), "{token:?}");
        }
        assert!(RelativeRange::parse("99999999999h").is_err());
        assert!(RelativeRange::parse("4000000000M").is_err());
    }

    #[test]
    fn test_long_relative_ranges_are_exact() {
        let now = utc(2025, 7, 28, 11, 15, 0);
        for (token, secs) in [
            ("400000d", 400_000i64 * 86_400),
            ("52000w", 52_000 * 604_800),
            ("2400000M", 2_400_000 * 30 * 86_400),
        ] {
            let w = RelativeRange::parse(token).unwrap().window_ending(now);
            assert_eq!((w.end - w.start).num_seconds(), secs, "{token}");
        }
    }

    #[test]
    fn test_explicit_summer_time_converted_to_utc() {
        // BST = UTC+1
        let ts = parse_local_datetime("2025-07-28T11:15", London).unwrap();
        assert_eq!(ts, utc(2025, 7, 28, 10, 15, 0));

        let ts = parse_local_datetime("2025-07-28T11:15:30", London).unwrap();
        assert_eq!(ts, utc(2025, 7, 28, 10, 15, 30));
    }

    #[test]
    fn test_explicit_z_suffix_is_still_local() {
        let ts = parse_local_datetime("2025-07-28T11:15:00Z", London).unwrap();
        assert_eq!(ts, utc(2025, 7, 28, 10, 15, 0));
    }

    #[test]
    fn test_explicit_winter_time_unchanged() {
        let ts = parse_local_datetime("2025-01-10T11:15", London).unwrap();
        assert_eq!(ts, utc(2025, 1, 10, 11, 15, 0));
    }

    #[test]
    fn test_dst_fold_picks_earlier_instant() {
        // 01:30 happens twice on 2025-10-26 in London.
        let ts = parse_local_datetime("2025-10-26T01:30", London).unwrap();
        assert_eq!(ts, utc(2025, 10, 26, 0, 30, 0));
    }

    #[test]
    fn test_dst_gap_shifts_forward() {
        // 01:30 does not exist on 2025-03-30 in London.
        let ts = parse_local_datetime("2025-03-30T01:30", London).unwrap();
        assert_eq!(ts, utc(2025, 3, 30, 1, 30, 0));
    }

    #[test]
    fn test_explicit_window_rejects_reversed_bounds() {
        assert!(parse_explicit_window("2025-07-28T12:00", "2025-07-28T11:00", London).is_err());
        let w = parse_explicit_window("2025-07-28T11:00", "2025-07-28T12:00", London).unwrap();
        assert_eq!(w.duration().num_seconds(), 3_600);
    }

    #[test]
    fn test_resolve_window_prefers_requested() {
        let now = utc(2025, 7, 28, 18, 0, 0);
        let default = RelativeRange::parse("1h").unwrap();
        let req = requested("2025-07-28T09:00", "2025-07-28T10:00");
        let w = resolve_window(&default, Some(&req), London, now);
        assert_eq!(w.start, utc(2025, 7, 28, 8, 0, 0));
        assert_eq!(w.end, utc(2025, 7, 28, 9, 0, 0));
    }

    #[test]
    fn test_resolve_window_falls_back_on_bad_requested() {
        let now = utc(2025, 7, 28, 18, 0, 0);
        let default = RelativeRange::parse("3h").unwrap();

        let bad = requested("yesterday", "2025-07-28T10:00");
        let w = resolve_window(&default, Some(&bad), London, now);
        assert_eq!(w, default.window_ending(now));

        let half = RequestedRange {
            start: Some("2025-07-28T09:00".into()),
            end: None,
        };
        let w = resolve_window(&default, Some(&half), London, now);
        assert_eq!(w, default.window_ending(now));
    }

    #[test]
    fn test_resolve_range_errors_without_any_valid_input() {
        let now = utc(2025, 7, 28, 18, 0, 0);
        assert!(resolve_range("1x", None, London, now).is_err());

        let bad = requested("nope", "nope");
        assert!(resolve_range("1x", Some(&bad), London, now).is_err());

        let good = requested("2025-07-28T09:00", "2025-07-28T10:00");
        assert!(resolve_range("1x", Some(&good), London, now).is_ok());

        let w = resolve_range("2h", None, London, now).unwrap();
        assert_eq!(w.duration().num_seconds(), 7_200);
    }
}
