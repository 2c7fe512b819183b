//! Utility modules for workviz.

mod time_parser;

pub use time_parser::{
    RangeUnit, RelativeRange, TimeWindow, parse_explicit_window, parse_local_datetime,
    resolve_range, resolve_window,
};
