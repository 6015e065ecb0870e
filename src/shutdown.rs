use std::sync::Arc;

use tokio::signal;

use crate::server::AppState;

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

/// Perform graceful shutdown of in-flight workflows.
///
/// With a snapshot store their running snapshots are left in place and
/// resumed on the next start. Without one they are cancelled.
pub async fn graceful_shutdown(state: &Arc<AppState>) {
    tracing::info!("Starting graceful shutdown...");

    let in_flight = state.registry.in_flight().await;
    if in_flight.is_empty() {
        tracing::info!("No in-flight workflows");
        return;
    }

    match state.registry.store() {
        Some(store) => {
            tracing::info!(
                count = in_flight.len(),
                dir = %store.dir().display(),
                "Leaving in-flight workflows persisted for resumption"
            );
        }
        None => {
            let cancelled = state.registry.cancel_all().await;
            tracing::warn!(
                count = cancelled,
                "Cancelled in-flight workflows; persistence is not configured"
            );
        }
    }

    tracing::info!("Graceful shutdown complete");
}
