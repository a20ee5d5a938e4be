use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use conductor::config::AppConfig;
use conductor::server::{create_router, AppState};
use conductor::shutdown::{graceful_shutdown, wait_for_shutdown};

#[derive(Parser)]
#[command(name = "conductor", about = "Workflow engine that turns GitHub issues into pull requests")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;

    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        repository = %config.github.repository,
        "Starting Conductor server"
    );

    // Analyst, tester, and developer implementations are registered by the
    // embedding integration; the stock binary ships only the built-in
    // delivery worker.
    let state = Arc::new(AppState::new(config.clone(), Vec::new())?);

    // Restore workflows persisted by a previous run
    match state.store.restore(&config.workflow.snapshot_path).await {
        Ok(count) if count > 0 => {
            tracing::info!(count = count, "Restored workflows from snapshot");
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = %e, "Failed to restore workflow snapshot");
        }
    }

    let app = create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(format!(
        "{}:{}",
        config.server.host, config.server.port
    ))
    .await?;

    tracing::info!("Listening on {}", listener.local_addr()?);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    // Persist workflow state before exiting
    graceful_shutdown(&state).await;

    Ok(())
}
