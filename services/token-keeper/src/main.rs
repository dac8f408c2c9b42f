//! Token Keeper
//!
//! Small daemon that keeps vendor OAuth2 tokens fresh:
//! 1. Loads accounts from a TOML config
//! 2. Shares one token source per (identity, refresh token) pair
//! 3. Refreshes every account in the background, persisting rotated tokens
//! 4. Serves `/health` (per-account loop status) and `/metrics`

mod accounts;
mod config;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use credential::{FileTokenStore, TokenStore};
use metrics_exporter_prometheus::PrometheusHandle;
use token_source::{LazyTokenSource, LoopStatus, TokenSourceCache};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::accounts::Accounts;
use crate::config::Config;

/// How long background loops get to stop after the shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Status of one configured account as seen by the health endpoint
#[derive(Clone)]
struct AccountStatus {
    name: String,
    source: Arc<LazyTokenSource>,
    status: watch::Receiver<LoopStatus>,
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    accounts: Arc<Vec<AccountStatus>>,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
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

    info!("starting token-keeper");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder()?;

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
        listen_addr = %config.keeper.listen_addr,
        accounts = config.accounts.len(),
        refresh_interval_secs = config.keeper.refresh_interval_secs,
        "configuration loaded"
    );

    let store: Option<Arc<dyn TokenStore>> = match &config.keeper.store_path {
        Some(path) => {
            let store = FileTokenStore::load(path.clone())
                .await
                .with_context(|| format!("failed to open token store {}", path.display()))?;
            Some(Arc::new(store))
        }
        None => {
            warn!("no store_path configured, refreshed tokens are kept in memory only");
            None
        }
    };

    let client = reqwest::Client::builder()
        .timeout(config.keeper.refresh_timeout())
        .build()
        .context("failed to build HTTP client")?;

    let cache = TokenSourceCache::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let accounts = Accounts::start(
        &config.keeper,
        &config.accounts,
        &client,
        store,
        &cache,
        &shutdown_rx,
    )
    .await?;

    info!(
        accounts = accounts.handles().len(),
        loops = accounts.loops(),
        "background refresh started"
    );

    let state = AppState {
        accounts: Arc::new(
            accounts
                .handles()
                .iter()
                .map(|handle| {
                    info!(account = %handle.name, key = %handle.key, "account registered");
                    AccountStatus {
                        name: handle.name.clone(),
                        source: handle.source.clone(),
                        status: handle.status.clone(),
                    }
                })
                .collect(),
        ),
        started_at: Instant::now(),
        prometheus,
    };

    let app = build_router(state, config.keeper.max_connections);
    let listen_addr = config.keeper.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    let mut server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    shutdown_signal().await;

    // Stops the HTTP server and every refresh loop
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("http server stopped"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "http server did not stop in time"
        ),
    }

    accounts.join(SHUTDOWN_TIMEOUT).await;

    info!("shutdown complete");
    Ok(())
}

/// Per-account loop status. 200 while no loop has given up, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut healthy = true;
    let mut accounts = Vec::with_capacity(state.accounts.len());

    for account in state.accounts.iter() {
        let status = *account.status.borrow();
        let failures = match status {
            LoopStatus::Failing { failures } | LoopStatus::GaveUp { failures } => failures,
            LoopStatus::Running | LoopStatus::Stopped => 0,
        };
        if matches!(status, LoopStatus::GaveUp { .. }) {
            healthy = false;
        }

        // Never triggers a refresh or waits on one in flight
        let credential = account.source.snapshot();
        accounts.push(serde_json::json!({
            "name": account.name,
            "status": status.label(),
            "consecutive_failures": failures,
            "token_valid": credential.is_valid(),
            "expires_in_seconds": credential.remaining().as_secs(),
        }));
    }

    let (status_code, status) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status_code,
        axum::Json(serde_json::json!({
            "status": status,
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "accounts": accounts,
        })),
    )
}

/// Prometheus text exposition of every recorded metric
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
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
