//! Oddsfeed Proxy Binary
//!
//! Starts the sports data fan-out proxy.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin oddsfeed-proxy
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `ODDSFEED_API_KEY`: Vendor API key
//! - `ODDSFEED_BASE_URL`: Vendor API base URL
//!
//! ## Optional
//! - `ODDSFEED_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `ODDSFEED_METRICS_PORT`: Prometheus metrics port (default: 9091)
//! - `ODDSFEED_ODDS_TICK_MS`: Odds poll interval (default: 1000)
//! - `ODDSFEED_SCORECARD_TICK_SECS`: Scorecard poll interval (default: 30)
//! - `ODDSFEED_FIXTURES_TICK_SECS`: Fixture poll interval (default: 120)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: oddsfeed-proxy)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use oddsfeed_proxy::infrastructure::health::{HealthServer, HealthServerState};
use oddsfeed_proxy::infrastructure::telemetry;
use oddsfeed_proxy::{
    HttpUpstreamProvider, Pipeline, ProxyConfig, UpstreamProvider, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Oddsfeed Proxy");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = ProxyConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let upstream: Arc<dyn UpstreamProvider> =
        Arc::new(HttpUpstreamProvider::new(config.upstream())?);
    let pipeline = Arc::new(Pipeline::new(&config, upstream));

    // Start publisher tick loops and queue dispatchers
    let tasks = pipeline.start(&shutdown_token);
    tracing::info!(tasks = tasks.len(), "Pipeline tasks started");

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&pipeline),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Oddsfeed proxy ready");

    await_shutdown(shutdown_token).await;

    // Give tick loops and in-flight jobs a bounded window to finish
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timeout reached with tasks still running"
        );
    }

    tracing::info!("Oddsfeed proxy stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
#[allow(clippy::cast_possible_truncation)]
fn log_config(config: &ProxyConfig) {
    tracing::info!(
        health_port = config.server.health_port,
        metrics_port = config.server.metrics_port,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        connection_buffer = config.connection_buffer,
        "Configuration loaded"
    );
    tracing::debug!(
        upstream_base_url = %config.upstream_base_url,
        odds_tick_ms = config.publisher.odds_tick.as_millis() as u64,
        scorecard_tick_secs = config.publisher.scorecard_tick.as_secs(),
        fixtures_tick_secs = config.publisher.fixtures_tick.as_secs(),
        "Poll schedule"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
