//! lanpulse collector daemon
//!
//! Opens the store, brings the monitoring engine up, and runs until
//! interrupted. The HTTP/dashboard transport attaches through the library
//! surface; this binary only hosts the core.

use anyhow::{Context, Result};

use lanpulse::{MonitorEngine, Store};

#[tokio::main]
async fn main() {
    if let Err(e) = lanpulse::logging::init_logging() {
        eprintln!("[WARN] Failed to initialize structured logging: {}", e);
    }

    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let db_path = std::env::var("LANPULSE_DB")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| Store::default_path());

    let store = Store::open(db_path).context("Failed to open store")?;
    let engine = MonitorEngine::with_defaults(store);

    engine
        .initialize()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize engine: {}", e))?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    engine.shutdown().await;
    Ok(())
}
