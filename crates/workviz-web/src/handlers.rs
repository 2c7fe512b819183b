//! HTTP request handlers.

use std::io::ErrorKind;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use workviz_core::config::DashboardDocument;
use workviz_core::dashboard::DashboardRequest;
use workviz_core::error::DashboardError;
use workviz_core::fmt::parse_timezone;

use crate::state::{AppState, is_valid_machine_name};

/// `{status, message, data}` response body.
#[derive(Debug, Serialize)]
pub(crate) struct ApiResponse {
    status: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn success(message: impl Into<String>, data: Value) -> ApiResult {
    (
        StatusCode::OK,
        Json(ApiResponse {
            status: "success",
            message: message.into(),
            data: Some(data),
        }),
    )
}

fn failure(code: StatusCode, message: impl Into<String>, data: Option<Value>) -> ApiResult {
    (
        code,
        Json(ApiResponse {
            status: "error",
            message: message.into(),
            data,
        }),
    )
}

// ============================================================
// Health
// ============================================================

pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

// ============================================================
// Dashboard
// ============================================================

#[derive(Debug, Deserialize)]
pub(crate) struct DashboardQuery {
    machine_name: Option<String>,
    /// Custom range start, local time in the reference zone.
    from: Option<String>,
    /// Custom range end, local time in the reference zone.
    to: Option<String>,
    /// IANA display zone.
    timezone: Option<String>,
}

pub(crate) async fn handle_dashboard(
    State(state): AppState,
    Query(query): Query<DashboardQuery>,
) -> ApiResult {
    let Some(machine) = query.machine_name.as_deref().map(str::trim) else {
        return failure(StatusCode::BAD_REQUEST, "machine_name is required", None);
    };
    if !is_valid_machine_name(machine) {
        return failure(
            StatusCode::BAD_REQUEST,
            format!("invalid machine name '{}'", machine),
            None,
        );
    }

    let timezone = match query.timezone.as_deref() {
        Some(name) if !name.trim().is_empty() => match parse_timezone(name) {
            Ok(tz) => tz,
            Err(e) => return failure(StatusCode::BAD_REQUEST, e.to_string(), None),
        },
        _ => state.default_timezone,
    };

    let path = state.document_path(machine);
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(machine, path = %path.display(), "no dashboard document for machine");
            return failure(
                StatusCode::NOT_FOUND,
                format!("unknown machine '{}'", machine),
                None,
            );
        }
        Err(e) => {
            error!(
                machine,
                path = %path.display(),
                error = %e,
                "failed to read dashboard document"
            );
            return failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to read dashboard configuration",
                None,
            );
        }
    };

    let document = match DashboardDocument::from_json(&text) {
        Ok(doc) => doc,
        Err(
            e @ (DashboardError::Config(_)
            | DashboardError::RangeFormat(_)
            | DashboardError::InvalidLimitType(_)),
        ) => {
            warn!(machine, error = %e, "invalid dashboard document");
            return failure(StatusCode::UNPROCESSABLE_ENTITY, e.to_string(), None);
        }
        Err(e) => {
            error!(machine, error = %e, "failed to load dashboard document");
            return failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), None);
        }
    };

    let request = DashboardRequest {
        from: non_empty(query.from),
        to: non_empty(query.to),
        timezone,
    };
    info!(
        machine,
        widgets = document.widgets.len(),
        from = ?request.from,
        to = ?request.to,
        timezone = %request.timezone,
        "running dashboard"
    );
    let result = state.orchestrator.run_dashboard(&document, &request).await;

    match serde_json::to_value(&result) {
        Ok(data) => success("Dashboard configuration loaded successfully", data),
        Err(e) => {
            error!(machine, error = %e, "failed to serialize dashboard");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to serialize dashboard", None)
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ============================================================
// InfluxDB health
// ============================================================

pub(crate) async fn handle_influx_health(State(state): AppState) -> ApiResult {
    let Some(client) = state.influx.as_ref() else {
        return failure(StatusCode::SERVICE_UNAVAILABLE, "InfluxDB client not configured", None);
    };

    match client.health().await {
        Ok(health) if health.is_pass() => success(
            "Connection Successful",
            json!({
                "influxdb_version": health.version,
                "server_time": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
        ),
        Ok(health) => failure(
            StatusCode::SERVICE_UNAVAILABLE,
            health.message.clone().unwrap_or_else(|| health.status.clone()),
            Some(json!({
                "status": health.status,
                "message": health.message,
                "version": health.version,
            })),
        ),
        Err(e) => {
            warn!(error = %e, "InfluxDB health check failed");
            failure(StatusCode::SERVICE_UNAVAILABLE, e.to_string(), None)
        }
    }
}
