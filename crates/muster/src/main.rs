use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use muster_core::config::Config;
use muster_core::db;
use muster_core::directory::HttpDirectoryClient;
use muster_core::driver;
use muster_core::mapping_sync;
use muster_core::store::MappingStore;

#[derive(Parser, Debug)]
#[command(author, version, about = "Clock event ingestion and duty-status sync", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process one pass over the event directory
    Run,
    /// Run database migrations
    Migrate,
    /// Refresh worker mappings from the directory now, schedule or not
    SyncMappings,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run => handle_run().await,
        Command::Migrate => handle_migrate().await,
        Command::SyncMappings => handle_sync_mappings().await,
    }
}

async fn handle_run() -> Result<()> {
    let config = Config::from_env()?;
    info!(
        event_dir = %config.event_dir.display(),
        batch_size = config.batch_size,
        max_retry_attempts = config.max_retry_attempts,
        move_archived = config.move_archived,
        "starting event run"
    );

    let store = open_store(&config).await?;
    let directory = connect_directory(&config).await?;

    driver::run_once(&config, &store, &directory).await?;
    Ok(())
}

async fn handle_migrate() -> Result<()> {
    let config = Config::from_env()?;
    let pool = db::connect(&config.db_path).await?;
    db::run_migrations(&pool).await?;
    info!("database migrations applied");
    Ok(())
}

async fn handle_sync_mappings() -> Result<()> {
    let config = Config::from_env()?;
    let store = open_store(&config).await?;
    let directory = connect_directory(&config).await?;

    let count = mapping_sync::refresh_worker_mappings(&store, &directory, &config).await?;
    info!(mappings = count, "worker mapping refresh finished");
    Ok(())
}

async fn open_store(config: &Config) -> Result<MappingStore> {
    let pool = db::connect(&config.db_path).await?;
    db::run_migrations(&pool).await?;
    Ok(MappingStore::new(pool))
}

async fn connect_directory(config: &Config) -> Result<HttpDirectoryClient> {
    HttpDirectoryClient::connect(&config.directory, &config.duty_status_field)
        .await
        .context("directory authentication failed")
}
