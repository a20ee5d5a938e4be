use std::sync::Arc;

use tokio::signal;

use crate::server::AppState;

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_shutdown() {
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

/// Perform graceful shutdown: snapshot every tracked workflow so waiting and
/// in-flight issues can be restored after a restart.
pub async fn graceful_shutdown(state: &Arc<AppState>) {
    tracing::info!("Starting graceful shutdown...");

    // Stop running loops at their next iteration boundary; waiting workflows
    // are snapshotted as-is and resume after restart.
    state.store.cancel_all().await;

    let snapshot_path = &state.config.workflow.snapshot_path;
    match state.store.snapshot(snapshot_path).await {
        Ok(count) => {
            tracing::info!(
                count = count,
                path = %snapshot_path.display(),
                "Snapshotted workflows"
            );
        }
        Err(e) => {
            tracing::warn!(
                path = %snapshot_path.display(),
                error = %e,
                "Failed to snapshot workflows during shutdown"
            );
        }
    }

    tracing::info!("Graceful shutdown complete");
}
