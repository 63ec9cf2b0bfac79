//! Market Stream Hub Binary
//!
//! Starts the gateway client, fan-out engine, SSE server and health server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-stream-hub
//! ```
//!
//! # Environment Variables
//!
//! - `MARKET_GATEWAY_PUSH_URL`: gateway push WebSocket (default: <ws://127.0.0.1:11112/push>)
//! - `MARKET_GATEWAY_REST_URL`: gateway REST base (default: <http://127.0.0.1:11112>)
//! - `MINUTE_BAR_DB_PATH`: SQLite path, empty for in-memory (default: data/minute_kline.db)
//! - `STREAM_HTTP_PORT`: SSE/API port (default: 8000)
//! - `STREAM_HEALTH_PORT`: health and metrics port (default: 8082)
//! - `STREAM_*`: engine capacities and intervals, see `HubConfig`
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`: span export
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_stream_hub::infrastructure::telemetry;
use market_stream_hub::{
    GatewayClient, HealthServer, HealthServerState, HubConfig, InMemoryMinuteBarStore,
    MinuteBarStore, SqliteMinuteBarStore, StreamRuntime, StreamServer, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Upper bound on draining the engine and joining the push thread.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Market Stream Hub");

    let _metrics_handle = init_metrics();

    let config = HubConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let store = open_store(&config)?;

    let gateway = Arc::new(
        GatewayClient::new(config.gateway.clone(), shutdown_token.child_token())
            .context("failed to build gateway client")?,
    );
    let feed = gateway.feed_state();

    let runtime = StreamRuntime::start(config.engine.clone(), gateway.clone(), Some(store))
        .context("failed to start stream runtime")?;

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        runtime.engine(),
        feed,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let stream_server = StreamServer::new(
        config.server.http_port,
        runtime.engine(),
        shutdown_token.clone(),
    );

    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });
    let stream_task = tokio::spawn(async move {
        if let Err(e) = stream_server.run().await {
            tracing::error!(error = %e, "Stream server error");
        }
    });

    tracing::info!("Market stream hub ready");

    await_shutdown(shutdown_token).await;

    let drain = async {
        runtime.shutdown().await;
        let _ = tokio::join!(health_task, stream_task);
        if let Err(e) = tokio::task::spawn_blocking(move || gateway.stop()).await {
            tracing::warn!(error = %e, "Gateway shutdown task failed");
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Graceful shutdown timed out"
        );
    }

    tracing::info!("Market stream hub stopped");
    Ok(())
}

/// Open the configured minute bar store.
fn open_store(config: &HubConfig) -> anyhow::Result<Arc<dyn MinuteBarStore>> {
    match &config.storage.db_path {
        Some(path) => {
            let store = SqliteMinuteBarStore::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            tracing::info!(path = %path.display(), "Minute bars stored in SQLite");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("Minute bars kept in memory");
            Ok(Arc::new(InMemoryMinuteBarStore::new()))
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &HubConfig) {
    tracing::info!(
        http_port = config.server.http_port,
        health_port = config.server.health_port,
        queue_capacity = config.engine.queue_capacity,
        kline_retention = config.engine.kline_retention,
        "Configuration loaded"
    );
    tracing::debug!(
        push_url = %config.gateway.push_url,
        rest_url = %config.gateway.rest_url,
        "Gateway endpoints"
    );
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

    tracing::info!("Graceful shutdown started");
}
