//! Pool API
//!
//! Single-binary Rust service that:
//! 1. Loads the pool keys and their credentials
//! 2. Opens the assignment store (in memory or a JSON file)
//! 3. Serves the internal get-key / log-usage / stats routes
//! 4. Drains in-flight requests on SIGTERM/SIGINT

mod api;
mod config;
mod error;
mod metrics;
mod service;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use key_pool::{AssignmentEngine, AssignmentStore, FileStore, MemoryStore, Registry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::AppState;
use crate::config::{Config, StoreBackend};
use crate::service::{DRAIN_TIMEOUT, ServiceMetrics};

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`; excess
/// requests queue rather than fail.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route(pool_client::GET_KEY_PATH, post(api::get_key_handler))
        .route(pool_client::LOG_USAGE_PATH, post(api::log_usage_handler))
        .route(pool_client::STATS_PATH, get(api::stats_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting pool-api");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder().context("installing metrics recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        pool_keys = config.pool.keys.len(),
        max_devices_per_user = config.pool.max_devices_per_user,
        store = ?config.store.backend,
        auth = config.server.api_key.is_some(),
        "configuration loaded"
    );

    let registry = Registry::new(config.pool_keys(), config.pool.selection.build())
        .context("building pool key registry")?;

    let store: Arc<dyn AssignmentStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => {
            let path = config
                .store
                .path
                .clone()
                .context("store.path is required for the file backend")?;
            let store = FileStore::load(path.clone())
                .await
                .with_context(|| format!("opening assignment store {}", path.display()))?;
            info!(
                assignments = %store.path().display(),
                usage_log = %store.usage_path().display(),
                "file store ready"
            );
            Arc::new(store)
        }
    };

    let engine = AssignmentEngine::new(Arc::new(registry), store, config.engine_config());
    let metrics = ServiceMetrics::new();

    let app_state = AppState {
        engine: Arc::new(engine),
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
        api_key: config.server.api_key.clone().map(Arc::new),
        derive_device_id: config.server.derive_device_id,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Clone in_flight counter for drain observability after shutdown
    let in_flight = metrics.in_flight.clone();

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: notify the server to drain, then race the drain against
    // the timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Liveness plus a few counters.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);

    let body = serde_json::json!({
        "status": "healthy",
        "service": "pool-api",
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
        "pool_keys": state.engine.registry().keys().len(),
        "selection": state.engine.registry().strategy_name(),
        "max_devices_per_user": state.engine.config().max_devices_per_user,
        "store": state.engine.store_backend(),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
