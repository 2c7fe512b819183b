//! Display-layer timestamp formatting.
//!
//! Query bounds and result rows are UTC; dashboards show wall-clock `HH:MM`
//! in the viewer's zone. Formatting never fails: anything unparseable is
//! returned as-is.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::debug;

use crate::error::ConfigError;

/// Compact clock format used in result rows.
pub const CLOCK_FORMAT: &str = "%H:%M";

/// Naive formats accepted by [`format_clock_str`]; interpreted as UTC.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Resolves an IANA zone name such as `Europe/London`.
pub fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ConfigError::new("timezone", format!("unknown timezone '{}'", name)))
}

/// Converts a UTC instant to wall-clock time in `tz`.
///
/// The offset is the one in force at `ts`, not today's.
pub fn to_display(ts: DateTime<Utc>, tz: Tz) -> DateTime<Tz> {
    ts.with_timezone(&tz)
}

/// Converts a wall-clock time back to UTC.
///
/// The zone offset travels with `local`, so both readings of a repeated
/// hour at the end of summer time map back to their own instant.
pub fn from_display(local: DateTime<Tz>) -> DateTime<Utc> {
    local.with_timezone(&Utc)
}

/// Formats a UTC instant as `HH:MM` in `tz`.
pub fn format_clock(ts: DateTime<Utc>, tz: Tz) -> String {
    to_display(ts, tz).format(CLOCK_FORMAT).to_string()
}

/// Formats an ISO-8601 timestamp string as `HH:MM` in the named zone.
///
/// Accepts `Z`/offset suffixed RFC 3339 and naive timestamps (taken as UTC).
/// On any failure the input is returned unchanged.
pub fn format_clock_str(input: &str, tz_name: &str) -> String {
    let tz = match parse_timezone(tz_name) {
        Ok(tz) => tz,
        Err(e) => {
            debug!(input, error = %e, "timestamp left unformatted");
            return input.to_string();
        }
    };

    match parse_utc(input) {
        Some(ts) => format_clock(ts, tz),
        None => {
            debug!(input, "unparseable timestamp left unformatted");
            input.to_string()
        }
    }
}

fn parse_utc(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .map(|ndt| Utc.from_utc_datetime(&ndt))
}
