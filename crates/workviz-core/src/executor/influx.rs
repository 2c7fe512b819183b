//! InfluxDB v2 HTTP executor.
//!
//! Queries are posted to `/api/v2/query` and answered as CSV (the
//! `header: true, annotations: []` dialect). A response holds one or more
//! blank-line separated blocks, each with its own header row; rows are
//! grouped into tables by the `result`/`table` columns. Query errors that
//! happen after the response started are reported in-band as an
//! `error,reference` block.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{QueryExecutor, RawRecord, RawTable};
use crate::error::ExecuteError;
use crate::query::FluxQuery;

/// Columns that never become tags.
const RESERVED_COLUMNS: [&str; 7] = ["", "result", "table", "_start", "_stop", "_time", "_value"];

/// Connection settings.
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Base URL, e.g. `http://localhost:8086`.
    pub url: String,
    pub org: String,
    pub token: String,
    /// Per-request HTTP timeout.
    pub timeout: Duration,
}

impl InfluxConfig {
    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), path)
    }
}

/// Bounded exponential backoff for the initial connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl HealthStatus {
    pub fn is_pass(&self) -> bool {
        self.status == "pass"
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// HTTP client for one InfluxDB organization.
#[derive(Debug, Clone)]
pub struct InfluxClient {
    client: Client,
    config: InfluxConfig,
}

impl InfluxClient {
    pub fn new(config: InfluxConfig) -> Result<Self, ExecuteError> {
        let client = Client::builder()
            .user_agent(concat!("workviz/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExecuteError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Builds a client and waits until the server reports healthy.
    ///
    /// Gives up with [`ExecuteError::Unavailable`] once `policy.max_attempts`
    /// health checks have failed.
    pub async fn connect(config: InfluxConfig, policy: RetryPolicy) -> Result<Self, ExecuteError> {
        let client = Self::new(config)?;
        let attempts = policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match client.health().await {
                Ok(health) if health.is_pass() => {
                    info!(
                        url = %client.config.url,
                        version = health.version.as_deref().unwrap_or("unknown"),
                        attempt,
                        "connected to InfluxDB"
                    );
                    return Ok(client);
                }
                Ok(health) => {
                    last_error = format!(
                        "health status '{}': {}",
                        health.status,
                        health.message.unwrap_or_default()
                    );
                }
                Err(e) => last_error = e.to_string(),
            }

            if attempt < attempts {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "InfluxDB not ready, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(ExecuteError::Unavailable {
            attempts,
            last_error,
        })
    }

    pub async fn health(&self) -> Result<HealthStatus, ExecuteError> {
        let response = self
            .client
            .get(self.config.endpoint("/health"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        // 503 still carries a health body with status "fail".
        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        match serde_json::from_str::<HealthStatus>(&body) {
            Ok(health) => Ok(health),
            Err(_) if !status.is_success() => Err(status_error(status, &body)),
            Err(e) => Err(ExecuteError::Decode(format!("health response: {}", e))),
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> ExecuteError {
        if e.is_timeout() {
            ExecuteError::Timeout(self.config.timeout)
        } else {
            ExecuteError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl QueryExecutor for InfluxClient {
    async fn execute(&self, query: &FluxQuery) -> Result<Vec<RawTable>, ExecuteError> {
        let flux = query.to_string();
        debug!(query = %flux, "executing flux query");

        let body = json!({
            "query": flux,
            "type": "flux",
            "dialect": {"header": true, "annotations": [], "delimiter": ","},
        });
        let response = self
            .client
            .post(self.config.endpoint("/api/v2/query"))
            .query(&[("org", self.config.org.as_str())])
            .header(AUTHORIZATION, format!("Token {}", self.config.token))
            .header(ACCEPT, "application/csv")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(e))?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        parse_csv_response(&text)
    }
}

fn status_error(status: StatusCode, body: &str) -> ExecuteError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| body.trim().to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExecuteError::Auth(message),
        StatusCode::BAD_REQUEST => ExecuteError::Query(message),
        _ => ExecuteError::Status {
            code: status.as_u16(),
            message,
        },
    }
}

/// Decodes a CSV query response into tables.
pub fn parse_csv_response(text: &str) -> Result<Vec<RawTable>, ExecuteError> {
    let normalized = text.replace("\r\n", "\n");
    let mut tables: Vec<RawTable> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for block in normalized.split("\n\n") {
        if block.trim().is_empty() {
            continue;
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(block.as_bytes());
        let headers = reader
            .headers()
            .map_err(|e| ExecuteError::Decode(e.to_string()))?
            .clone();
        let column = |name: &str| headers.iter().position(|h| h == name);

        if let Some(error_col) = column("error") {
            let message = reader
                .records()
                .next()
                .and_then(|r| r.ok())
                .and_then(|r| r.get(error_col).map(str::to_string))
                .unwrap_or_else(|| "unknown query error".to_string());
            return Err(ExecuteError::Query(message));
        }

        let (Some(time_col), Some(value_col)) = (column("_time"), column("_value")) else {
            debug!(columns = ?headers, "skipping block without _time/_value");
            continue;
        };
        let result_col = column("result");
        let table_col = column("table");
        let tag_cols: Vec<(usize, &str)> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| !RESERVED_COLUMNS.contains(h))
            .collect();

        for row in reader.records() {
            let row = row.map_err(|e| ExecuteError::Decode(e.to_string()))?;
            let raw_time = row.get(time_col).unwrap_or_default();
            if raw_time.is_empty() {
                continue;
            }
            let time = DateTime::parse_from_rfc3339(raw_time)
                .map_err(|e| ExecuteError::Decode(format!("bad _time '{}': {}", raw_time, e)))?
                .with_timezone(&Utc);
            let Some(value) = parse_value(row.get(value_col).unwrap_or_default()) else {
                debug!(value = ?row.get(value_col), "skipping non-numeric value");
                continue;
            };

            let tags: BTreeMap<String, String> = tag_cols
                .iter()
                .filter_map(|&(i, name)| row.get(i).map(|v| (name.to_string(), v.to_string())))
                .collect();
            let key = (
                result_col.and_then(|i| row.get(i)).unwrap_or_default().to_string(),
                table_col.and_then(|i| row.get(i)).unwrap_or_default().to_string(),
            );
            let slot = *index.entry(key).or_insert_with(|| {
                tables.push(RawTable::default());
                tables.len() - 1
            });
            tables[slot].records.push(RawRecord { time, value, tags });
        }
    }

    Ok(tables)
}

fn parse_value(raw: &str) -> Option<f64> {
    match raw {
        "true" => Some(1.0),
        "false" => Some(0.0),
        other => other.parse::<f64>().ok(),
    }
}
