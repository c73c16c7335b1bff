//! # Beacon Server
//!
//! Realtime connection server: topic-based publish/subscribe with
//! per-subscription authorization and cross-process broadcast.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! beacon
//!
//! # Run with environment variables
//! BEACON_PORT=8080 BEACON_HOST=0.0.0.0 beacon
//! ```
//!
//! Configuration is read from `beacon.toml` if present.

mod access;
mod bootstrap;
mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use beacon_core::{build_bus, build_cache, BroadcastRelay, Connections};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Beacon server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(error) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("Failed to start metrics server: {}", error);
        }
    }

    // The single process-wide cache handle, injected into handlers
    let cache = build_cache(&config.cache)
        .await
        .context("Failed to build cache backend")?;

    // Relay over the configured bus
    let connections = Arc::new(Connections::new());
    let bus = build_bus(&config.relay)
        .await
        .context("Failed to build relay bus")?;
    let relay = Arc::new(BroadcastRelay::new(bus, Arc::clone(&connections)));
    let relay_loop = relay
        .start()
        .await
        .context("Failed to start relay consume loop")?;

    // Explicit registration phase: validator and handler tables are
    // frozen before the listener accepts its first connection
    let access = Arc::new(access::StaticAccessControl::new(&config.auth));
    let handles = bootstrap::build_core(access, cache.clone(), relay, &config.limits)
        .context("Invalid validator/handler registration")?;

    let state = Arc::new(handlers::AppState {
        connections,
        registry: handles.registry,
        dispatcher: handles.dispatcher,
        identities: access::StaticIdentityProvider::new(&config.auth),
        config,
    });

    let result = handlers::run_server(state).await;

    // Process shutdown: stop the relay loop and release cache resources
    relay_loop.abort();
    cache.stop().await.ok();

    result
}
