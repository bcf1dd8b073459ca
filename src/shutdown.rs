use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. Workers and the supervisor monitor this token and drain
/// gracefully, finishing any in-flight transition before exiting.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGINT handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}

/// Wait for the given worker handles to finish, up to `grace`.
///
/// Tasks that do not complete within the grace period are abandoned;
/// any job they held will be picked up by the staleness scan.
pub async fn drain(handles: Vec<JoinHandle<()>>, grace: Duration) {
    let join_all = async {
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Worker task panicked during drain");
            }
        }
    };

    if tokio::time::timeout(grace, join_all).await.is_err() {
        tracing::warn!(grace = ?grace, "Drain grace period elapsed, abandoning remaining workers");
    }
}
