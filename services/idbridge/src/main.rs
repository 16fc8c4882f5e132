//! idbridge
//!
//! OpenID Connect provider that federates logins to upstream identity
//! systems through pluggable connectors:
//! 1. Loads clients, connectors and static passwords from TOML
//! 2. Keeps an ES256 signing key rotating in the background
//! 3. Serves the authorization, callback, token, JWKS and discovery endpoints
//! 4. Garbage-collects expired requests, codes and refresh tokens

mod config;
mod error;
mod handlers;
mod metrics;
mod setup;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use storage::{MemStorage, Storage};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::handlers::{AppState, build_router};

/// Time allowed for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filtered by LOG_LEVEL or RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting idbridge");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install metrics recorder")?;

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
        issuer = %config.issuer,
        listen_addr = %config.web.listen_addr,
        clients = config.static_clients.len(),
        connectors = config.connectors.len(),
        "configuration loaded"
    );

    let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
    setup::seed(storage.as_ref(), &config)
        .await
        .context("failed to seed storage")?;

    let server = Arc::new(setup::build_server(storage.clone(), &config));
    let opened = setup::open_connectors(&server)
        .await
        .context("failed to open connectors")?;
    info!(connectors = opened, "connectors ready");

    server
        .keys()
        .rotate()
        .await
        .context("failed to create initial signing key")?;
    let rotation_task = keys::spawn_rotation_task(
        server.keys().clone(),
        Duration::from_secs(config.expiry.rotation_check_secs),
    );
    let gc_task = oidc::spawn_gc_task(
        storage,
        Duration::from_secs(config.oauth2.gc_interval_secs),
    );

    let app_state = AppState {
        server,
        prometheus: prometheus_handle,
        request_timeout: config.request_timeout(),
        started_at: Instant::now(),
    };
    let app = build_router(app_state, &config.issuer_path(), config.web.max_connections);

    let listen_addr = config.web.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts when the signal arrives, not at startup.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
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
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    rotation_task.abort();
    gc_task.abort();

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown. A handler that fails to
/// install never fires; the other one still does.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
