//! Server entry point and process lifecycle.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::listener::BridgeListener;
use crate::log_sink::SharedSink;
use crate::uid::UidAllocator;

/// Run the bridge server until SIGINT/SIGTERM or `shutdown` fires.
///
/// Live bridges and their channels are released before this returns.
pub async fn serve(
    config: ServerConfig,
    sink: SharedSink,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let uids = Arc::new(UidAllocator::new());
    let listener = BridgeListener::bind(config, uids, sink).await?;

    info!(
        bridge = %listener.local_addr(),
        channel = %listener.channel_addr(),
        "Starting bridgelet server"
    );

    let signal_shutdown = shutdown.clone();
    let signals = tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => signal_shutdown.cancel(),
            _ = signal_shutdown.cancelled() => {}
        }
    });

    let result = listener.run(shutdown.clone()).await;
    shutdown.cancel();
    let _ = signals.await;

    info!("Server shutdown complete");
    result
}

/// Wait for SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// tokio runtime is misconfigured. That is a startup bug worth failing fast on.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
