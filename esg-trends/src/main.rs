//! esg-trends - ESG trend engine daemon
//!
//! Opens the trend archive, restores reliability scores and the last
//! computed generation, then refreshes trends on a timer until Ctrl-C.

use anyhow::Result;
use clap::Parser;
use esg_common::config::{load_toml_config, resolve_root_folder};
use esg_common::events::EventBus;
use esg_common::logging::init_logging;
use esg_trends::scheduler::spawn_refresh_timer;
use esg_trends::store::{SqliteReliabilityStore, SqliteStore};
use esg_trends::{EngineConfig, TrendService};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Database file name inside the root folder
const DB_FILE: &str = "esg-trends.db";

#[derive(Debug, Parser)]
#[command(name = "esg-trends", version, about = "ESG trend engine")]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root folder holding the database
    #[arg(long)]
    root_folder: Option<String>,

    /// Refresh interval override in seconds
    #[arg(long)]
    interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Step 1: configuration and logging
    let toml_config = load_toml_config(args.config.as_deref())?;
    init_logging(&toml_config.logging)?;

    info!("Starting esg-trends");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = EngineConfig::from_toml(&toml_config)?;
    if let Some(secs) = args.interval_secs {
        config.scheduler.refresh_interval_secs = secs;
        config.validate()?;
    }

    // Step 2: root folder and database
    let root_folder = resolve_root_folder(args.root_folder.as_deref(), &toml_config);
    let db_path = root_folder.join(DB_FILE);
    info!("Database: {}", db_path.display());
    let store = SqliteStore::open(&db_path).await?;

    // Step 3: service
    let reliability = Arc::new(SqliteReliabilityStore::new(&config.reliability, store.clone()));
    let events = EventBus::new(256);
    let interval = config.scheduler.refresh_interval();
    let service = TrendService::new(config, reliability, Arc::new(store), events);
    service.restore().await?;

    // Step 4: refresh loop until Ctrl-C
    let shutdown = CancellationToken::new();
    let timer = spawn_refresh_timer(service.clone(), interval, shutdown.clone());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.cancel();
    if let Err(e) = timer.await {
        warn!("Refresh timer ended abnormally: {}", e);
    }

    match tokio::time::timeout(Duration::from_secs(10), service.persist_reliability()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Failed to persist reliability scores: {}", e),
        Err(_) => warn!("Timed out persisting reliability scores"),
    }

    info!("esg-trends stopped");
    Ok(())
}
