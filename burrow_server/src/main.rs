//! Burrow Server - public end of the tunneling service
//!
//! This server handles:
//! - Control-plane WebSocket connections from tunnel clients
//! - Public HTTP and WebSocket ingress to tunneled services
//! - Subdomain registration with validation and rate limiting

mod auth;
mod config;
mod limiter;
mod pending;
mod registry;
mod routes;
mod sessions;

use clap::Parser;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,burrow_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::parse();
    tracing::info!("Starting Burrow server on {}:{}", config.host, config.port);
    tracing::info!(
        "Base domain: {} (tunnels at *.{})",
        config.domain,
        config.domain
    );
    if config.auth_required && config.master_key.is_none() {
        tracing::warn!("Auth required without a master key: accepting any non-empty key");
    }
    if !config.rate_limits_enabled() {
        tracing::warn!("Rate limiting is disabled");
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let (state, background_tasks) = routes::AppState::new(config);

    let app = axum::Router::new()
        .fallback(routes::handle_fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Tear down background work in reverse construction order
    for task in background_tasks.into_iter().rev() {
        task.abort();
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown requested");
}
