//! Publish Gateway
//!
//! Single-binary Rust service that:
//! 1. Keeps a pool of platform credentials per workspace
//! 2. Accepts publish requests over HTTP
//! 3. Walks the fallback strategy chain until the content is published or
//!    every applicable strategy has failed
//! 4. Sweeps the pools in the background (rate-limit expiry, token refresh)

mod api;
mod config;
mod error;
mod metrics;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use credential_pool::{CredentialPools, CredentialStore, spawn_sweep_task};
use publisher::Publisher;
use upstream::{HttpTranscoder, HttpUpstream, MediaConverter, ReuseLocator, Upstream};

use crate::api::{AppState, build_router};
use crate::config::Config;

/// How long in-flight publishes may run after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

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

    info!("starting publish-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

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
        upstream_url = %config.upstream.base_url,
        transcoder = config.upstream.transcoder_url.is_some(),
        store_path = %config.pool.store_path.display(),
        "configuration loaded"
    );

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.upstream.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let upstream: Arc<dyn Upstream> =
        Arc::new(HttpUpstream::new(client.clone(), &config.upstream.base_url));
    let converter: Arc<dyn MediaConverter> = match &config.upstream.transcoder_url {
        Some(url) => Arc::new(HttpTranscoder::new(client, url)),
        None => {
            warn!("no transcoder configured, format fallback will be unavailable");
            Arc::new(ReuseLocator)
        }
    };

    let store = CredentialStore::load(config.pool.store_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to load credential store from {}",
                config.pool.store_path.display()
            )
        })?;
    let pools = Arc::new(
        CredentialPools::restore(upstream.clone(), Arc::new(store))
            .await
            .context("failed to restore credential pools")?,
    );
    info!(
        workspaces = pools.workspace_ids().await.len(),
        "credential pools restored"
    );

    let sweep_interval = Duration::from_secs(config.pool.sweep_interval_secs);
    let sweep_handle = spawn_sweep_task(
        pools.clone(),
        sweep_interval,
        Duration::from_secs(config.pool.refresh_lookahead_secs),
    );

    let publisher = Publisher::with_settings(
        pools.clone(),
        upstream,
        converter,
        config.classifier(),
        config.retry_policy(),
        config.publish_policy(),
    );

    let app_state = AppState {
        pools,
        publisher: Arc::new(publisher),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
        sweep_interval,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
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

    sweep_handle.abort();

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
