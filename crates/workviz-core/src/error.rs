//! Error types for the dashboard pipeline.
//!
//! `DashboardError` is the umbrella type returned by pipeline stages. Callers
//! branch on the variant: `EmptyResult` and `Execute` degrade to a `null`
//! slot in the widget batch, `RangeFormat` degrades to the default range at
//! dashboard load, `Config` and `InvalidLimitType` are surfaced.

use std::time::Duration;

/// Malformed relative range token or unparseable explicit bound.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeFormatError {
    pub input: String,
    pub message: String,
}

impl RangeFormatError {
    pub(crate) fn new(input: &str, message: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RangeFormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid range '{}': {}", self.input, self.message)
    }
}

impl std::error::Error for RangeFormatError {}

/// Invalid or missing configuration value.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigError {
    /// Dotted path of the offending field, e.g. `3.Queries[0].Bucket`.
    pub field: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn missing(field: &str) -> Self {
        Self::new(field, "required field is missing or empty")
    }

    /// Prefixes the field path with the enclosing scope.
    pub(crate) fn within(mut self, scope: &str) -> Self {
        self.field = if self.field.is_empty() {
            scope.to_string()
        } else if self.field.starts_with('[') {
            format!("{}{}", scope, self.field)
        } else {
            format!("{}.{}", scope, self.field)
        };
        self
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.field.is_empty() {
            write!(f, "config error: {}", self.message)
        } else {
            write!(f, "config error at {}: {}", self.field, self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

/// Failure talking to the time-series store.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteError {
    /// Connection, DNS or I/O failure.
    Transport(String),
    /// Rejected credentials (HTTP 401/403).
    Auth(String),
    /// Any other non-success HTTP status.
    Status { code: u16, message: String },
    /// The store accepted the request but reported a query error.
    Query(String),
    /// Response body could not be decoded.
    Decode(String),
    /// Execution exceeded its deadline.
    Timeout(Duration),
    /// Connection attempts exhausted.
    Unavailable { attempts: u32, last_error: String },
}

impl std::fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecuteError::Transport(msg) => write!(f, "transport error: {}", msg),
            ExecuteError::Auth(msg) => write!(f, "authentication failed: {}", msg),
            ExecuteError::Status { code, message } => {
                write!(f, "unexpected status {}: {}", code, message)
            }
            ExecuteError::Query(msg) => write!(f, "query error: {}", msg),
            ExecuteError::Decode(msg) => write!(f, "decode error: {}", msg),
            ExecuteError::Timeout(d) => write!(f, "query timed out after {:?}", d),
            ExecuteError::Unavailable {
                attempts,
                last_error,
            } => write!(
                f,
                "store unavailable after {} attempts: {}",
                attempts, last_error
            ),
        }
    }
}

impl std::error::Error for ExecuteError {}

/// Umbrella error for the dashboard pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum DashboardError {
    RangeFormat(RangeFormatError),
    Config(ConfigError),
    /// The query succeeded but returned no rows.
    EmptyResult,
    /// Reducer selector other than `Max`/`Min`.
    InvalidLimitType(String),
    Execute(ExecuteError),
}

impl DashboardError {
    /// Whether the error is local to one query and should degrade to `null`.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DashboardError::EmptyResult | DashboardError::Execute(_))
    }
}

impl std::fmt::Display for DashboardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DashboardError::RangeFormat(e) => write!(f, "{}", e),
            DashboardError::Config(e) => write!(f, "{}", e),
            DashboardError::EmptyResult => write!(f, "query returned no data"),
            DashboardError::InvalidLimitType(t) => {
                write!(f, "invalid limit type '{}': expected 'Max' or 'Min'", t)
            }
            DashboardError::Execute(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DashboardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DashboardError::RangeFormat(e) => Some(e),
            DashboardError::Config(e) => Some(e),
            DashboardError::Execute(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RangeFormatError> for DashboardError {
    fn from(e: RangeFormatError) -> Self {
        DashboardError::RangeFormat(e)
    }
}

impl From<ConfigError> for DashboardError {
    fn from(e: ConfigError) -> Self {
        DashboardError::Config(e)
    }
}

impl From<ExecuteError> for DashboardError {
    fn from(e: ExecuteError) -> Self {
        DashboardError::Execute(e)
    }
}
