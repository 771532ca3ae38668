//! Signal-driven cancellation.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Token cancelled on SIGTERM or SIGINT (Ctrl-C elsewhere).
///
/// Must be called from within a Tokio runtime. The watcher task ends once the
/// token is cancelled for any reason.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = trigger.cancelled() => {}
            _ = wait_for_signal() => {
                info!("Shutdown: preparing to shut down");
                trigger.cancel();
            }
        }
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }
        _ => {
            warn!("Failed to set up signal handlers, running without signal handling");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C, initiating graceful shutdown");
}
