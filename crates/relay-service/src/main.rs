//! Airwave Relay Service
//!
//! Signaling relay and stream registry for live-audio broadcast.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the signal store (Redis, or in-memory when unset)
//! 4. Spawn the session registry and build the router
//! 5. Bind the listener and flip readiness
//! 6. Serve until SIGINT/SIGTERM, then drain

#![warn(clippy::pedantic)]

use std::net::SocketAddr;

use anyhow::Context;
use relay_service::app::RelayApp;
use relay_service::config::Config;
use relay_service::observability::metrics::init_metrics_recorder;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Relay Service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let signal_store = if config.signal_store_url.is_some() {
        "redis"
    } else {
        "memory"
    };
    info!(
        instance_id = %config.instance_id,
        bind_address = %config.bind_address,
        signal_store,
        heartbeat_timeout_seconds = config.heartbeat_timeout_seconds,
        disconnect_grace_seconds = config.disconnect_grace_seconds,
        offer_replay_limit = config.offer_replay_limit,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to initialize metrics");
        anyhow::anyhow!(e)
    })?;

    let bind_address: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.bind_address))?;

    let app = RelayApp::build(config).await.map_err(|e| {
        error!(error = %e, "Failed to initialize relay");
        e
    })?;
    let router = app.router(metrics_handle);

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;

    info!("Relay listening on {}", bind_address);
    app.health.set_ready();

    let shutdown_app = app.clone();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, draining relay connections");
        shutdown_app.shutdown();
    })
    .await
    .context("Server error")?;

    info!("Relay Service shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
