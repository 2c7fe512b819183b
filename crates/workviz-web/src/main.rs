mod access_log;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use chrono_tz::Tz;
use clap::Parser;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use workviz_core::aggregation::{AggregationConfig, DEFAULT_LADDER};
use workviz_core::dashboard::{DashboardSettings, Orchestrator};
use workviz_core::executor::influx::{InfluxClient, InfluxConfig, RetryPolicy};
use workviz_core::fmt::parse_timezone;

use access_log::AccessLogLayer;
use state::{SharedState, WebAppInner};

const DEFAULT_LOG_FILTER: &str = "workviz_web=info,workviz_core=info";

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(
    name = "workviz-web",
    about = "workviz dashboard API server",
    version = workviz_core::VERSION
)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8080", env = "WORKVIZ_LISTEN")]
    listen: SocketAddr,

    /// Directory with per-machine dashboard documents (`<machine>.json`).
    #[arg(long, default_value = "config", env = "WORKVIZ_CONFIG_DIR")]
    config_dir: PathBuf,

    /// InfluxDB base URL.
    #[arg(long, default_value = "http://localhost:8086", env = "WORKVIZ_INFLUX_URL")]
    influx_url: String,

    /// InfluxDB organization.
    #[arg(long, env = "WORKVIZ_INFLUX_ORG")]
    influx_org: String,

    /// InfluxDB API token.
    #[arg(long, env = "WORKVIZ_INFLUX_TOKEN", hide_env_values = true)]
    influx_token: String,

    /// Connection attempts before giving up at startup.
    #[arg(long, default_value = "5", env = "WORKVIZ_CONNECT_ATTEMPTS")]
    connect_attempts: u32,

    /// Default display timezone for result timestamps.
    #[arg(
        long,
        default_value = "Europe/London",
        env = "WORKVIZ_TIMEZONE",
        value_parser = parse_tz
    )]
    timezone: Tz,

    /// Timezone explicit custom ranges are written in.
    #[arg(
        long,
        default_value = "Europe/London",
        env = "WORKVIZ_REFERENCE_TIMEZONE",
        value_parser = parse_tz
    )]
    reference_timezone: Tz,

    /// Maximum number of queries in flight.
    #[arg(long, default_value = "8", env = "WORKVIZ_MAX_CONCURRENCY")]
    max_concurrency: usize,

    /// Per-query deadline in seconds.
    #[arg(long, default_value = "30", env = "WORKVIZ_QUERY_TIMEOUT")]
    query_timeout: u64,

    /// Point budget for full-size widgets.
    #[arg(long, default_value = "1500", env = "WORKVIZ_FULL_POINTS")]
    full_points: u32,

    /// Point budget for minimised widgets.
    #[arg(long, default_value = "500", env = "WORKVIZ_MINIMISED_POINTS")]
    minimised_points: u32,
}

fn parse_tz(s: &str) -> Result<Tz, String> {
    parse_timezone(s).map_err(|e| e.to_string())
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async_main(args));
}

async fn async_main(args: Args) {
    info!(version = workviz_core::VERSION, config_dir = %args.config_dir.display(), "starting");

    let (full, minimised) = (args.full_points, args.minimised_points);
    let aggregation = match AggregationConfig::new(full, minimised, DEFAULT_LADDER.to_vec()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid aggregation settings");
            process::exit(1);
        }
    };

    let query_timeout = Duration::from_secs(args.query_timeout.max(1));
    let influx_config = InfluxConfig {
        url: args.influx_url.clone(),
        org: args.influx_org.clone(),
        token: args.influx_token.clone(),
        timeout: query_timeout,
    };
    let policy = RetryPolicy {
        max_attempts: args.connect_attempts,
        ..RetryPolicy::default()
    };
    let influx = match InfluxClient::connect(influx_config, policy).await {
        Ok(client) => client,
        Err(e) => {
            error!(url = %args.influx_url, error = %e, "failed to connect to InfluxDB");
            process::exit(1);
        }
    };

    let settings = DashboardSettings {
        aggregation,
        reference_tz: args.reference_timezone,
        max_concurrency: args.max_concurrency,
        query_timeout,
    };
    info!(
        max_concurrency = settings.max_concurrency,
        query_timeout_s = args.query_timeout,
        timezone = %args.timezone,
        "dashboard settings"
    );

    let state: SharedState = Arc::new(WebAppInner {
        orchestrator: Orchestrator::new(Arc::new(influx.clone()), settings),
        config_dir: args.config_dir.clone(),
        default_timezone: args.timezone,
        influx: Some(influx),
    });

    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr = args.listen;
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    axum::serve(listener, app).await.expect("server error");
}

pub(crate) fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/health", get(handlers::handle_health))
        .route("/api/v1/dashboard", get(handlers::handle_dashboard))
        .route("/api/v1/influx/health", get(handlers::handle_influx_health))
        .with_state(state)
        .layer(AccessLogLayer)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
}
