//! workviz-core: time-series pipeline behind the machine dashboards.
//!
//! Provides:
//! - `config`: dashboard document schema, validated at load time
//! - `util`: relative/explicit time window resolution
//! - `aggregation`: downsampling interval selection
//! - `query`: Flux query AST and builder
//! - `executor`: query execution seam and in-memory mock
//! - `table`: reshaping raw results into wide tables, top-N reduction
//! - `fmt`: display timestamp formatting
//! - `dashboard`: concurrent widget orchestration and result envelope
//! - `error`: error types
//!
//! With `influx` feature (default):
//! - `executor::influx`: InfluxDB v2 HTTP client

pub mod aggregation;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod executor;
pub mod fmt;
pub mod query;
pub mod table;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
