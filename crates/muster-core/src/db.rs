use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

pub type DbPool = Pool<Sqlite>;

/// Open the mapping store database, creating the file if needed. One
/// connection is all the single-writer engine ever uses.
pub async fn connect(db_path: &Path) -> Result<DbPool> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open mapping store at {}", db_path.display()))
}

/// Ephemeral in-memory store. The single connection must never be recycled
/// or the database vanishes with it.
pub async fn connect_memory() -> Result<DbPool> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .with_context(|| "failed to open in-memory mapping store")
}

/// Run database migrations embedded at compile-time.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .with_context(|| "failed to run database migrations")
}
