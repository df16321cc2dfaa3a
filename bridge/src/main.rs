//! HookBridge entry point.
//!
//! Wires the pieces together: config, channel pool, router, listener.
//! Broker connectivity is established before the listener binds, so the
//! process never accepts a webhook it has no way to republish.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hookbridge::web::app_router;
use hookbridge::{AppState, ChannelPool, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("bridge_starting");

    let config = Config::from_env().context("Invalid configuration")?;
    info!(
        exchange = %config.exchange_name,
        endpoint = %config.endpoint_path,
        pool_min = config.pool_min,
        pool_max = config.pool_max,
        port = config.port,
        "config_loaded"
    );

    // Fatal if the broker is unreachable: exit non-zero before binding.
    let pool = ChannelPool::open(&config)
        .await
        .context("Failed to open broker channel pool")?;

    let port = config.port;
    let state = AppState::new(config, pool.clone());
    let app = app_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "bridge_listening");

    // On SIGINT/SIGTERM the listener stops accepting and the pool starts
    // refusing checkouts; in-flight requests keep their leases and run to
    // completion before serve returns.
    let shutdown = {
        let pool = pool.clone();
        async move {
            hookbridge::shutdown::signal().await;
            pool.begin_drain();
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    // Drain outstanding publishes, then close channels and connection.
    pool.close().await;

    info!("bridge_shutdown_complete");

    Ok(())
}
