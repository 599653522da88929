use std::sync::Arc;

use clap::Parser;
use stowage::config::Config;
use stowage::server::{self, AppState};
use stowage::storage::filesystem::FilesystemStore;
use stowage::storage::multipart::MultipartManager;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let storage = FilesystemStore::new(&config.data_dir).await?;
    let uploads = MultipartManager::new(&config.data_dir).await;

    let state = AppState {
        storage: Arc::new(storage),
        uploads: Arc::clone(&uploads),
        config: Arc::new(config.clone()),
    };
    let app = server::build_router(state);

    let addr = format!("{}:{}", config.address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("stowage listening on {}", addr);
    tracing::info!("Data dir:  {}", config.data_dir);
    tracing::info!("Auth:      {}", if config.enable_auth { "enabled" } else { "disabled" });
    tracing::info!("Read-only: {}", config.read_only);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Join the janitor before exiting so nothing races process teardown.
    uploads.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, draining connections...");
}
