//! Shutdown signal handling.

use tokio::signal;
use tracing::info;

/// Resolve when a termination signal (SIGINT or SIGTERM) is received.
///
/// Used as the graceful-shutdown trigger for the web server: once this
/// completes the listener stops accepting connections, and `main` drains
/// and closes the channel pool before exiting.
pub async fn signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("bridge_shutting_down");
}
