//! Player Sync Server - authoritative real-time player state synchronization
//!
//! Clients connect over WebSocket with a `playerID`, stream position and
//! direction updates, and receive their validated state on a fixed cadence.

mod app;
mod config;
mod game;
mod http;
mod util;
mod ws;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::{Config, LogFormat};
use crate::http::build_router;
use crate::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level, config.log_format);

    // Initialize server time tracking
    init_server_time();

    info!("Starting Player Sync Server");
    info!(
        screen_width = config.sync.screen_width,
        allowed_delta = config.sync.allowed_delta,
        broadcast_interval_ms = config.sync.broadcast_interval.as_millis() as u64,
        "Movement policy"
    );

    // Create application state
    let state = AppState::new(config.clone());

    // Build router
    let router = build_router(state.clone());

    // Start server
    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("WebSocket endpoint: ws://{}/ws?playerID=<id>", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Upgraded connections are not tracked by the HTTP server, release them here
    state.registry.shutdown_all().await;
    if !state.registry.drain(config.shutdown_grace).await {
        warn!(
            remaining = state.registry.len(),
            "Sessions still open after shutdown grace period"
        );
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
