//! Shared application state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use chrono_tz::Tz;

use workviz_core::dashboard::Orchestrator;
use workviz_core::executor::influx::InfluxClient;

pub(crate) struct WebAppInner {
    pub(crate) orchestrator: Orchestrator,
    /// Directory holding `<machine>.json` dashboard documents.
    pub(crate) config_dir: PathBuf,
    /// Display zone when the request does not name one.
    pub(crate) default_timezone: Tz,
    /// `None` when running without a store (tests).
    pub(crate) influx: Option<InfluxClient>,
}

impl WebAppInner {
    pub(crate) fn document_path(&self, machine: &str) -> PathBuf {
        document_path(&self.config_dir, machine)
    }
}

pub(crate) type SharedState = Arc<WebAppInner>;

pub(crate) type AppState = State<SharedState>;

/// Machine names are restricted to `[A-Za-z0-9_-]+`.
pub(crate) fn is_valid_machine_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn document_path(dir: &Path, machine: &str) -> PathBuf {
    dir.join(format!("{}.json", machine))
}
