//! SQLite database connection management.
//!
//! Opens a connection pool for one embedded store with the durability and
//! performance settings every store in a project shares:
//!
//! - **WAL** journal mode, so reads proceed while a write is in progress.
//! - `synchronous = NORMAL`, which is crash-safe under WAL and avoids an
//!   fsync per commit.
//! - `temp_store = MEMORY` for sort and index scratch space.
//! - A page cache sized from [`DbConfig::cache_size_kib`].
//!
//! The pool is used directly for reads. Writes go through the store's
//! [`WriteQueue`](crate::storage::WriteQueue), so SQLite never sees two
//! writers from this process at once.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;

use crate::config::DbConfig;

/// Open a pool on the SQLite file at `db_path`, creating it and its parent
/// directory if needed.
pub async fn connect(db_path: &Path, config: &DbConfig) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create store directory {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(10))
        .pragma("temp_store", "MEMORY")
        // Negative cache_size is interpreted by SQLite as KiB.
        .pragma("cache_size", format!("-{}", config.cache_size_kib.max(1)));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open store {}", db_path.display()))?;

    Ok(pool)
}

/// Open an existing SQLite file read-only. Used for attached documentation bundles.
pub async fn connect_read_only(db_path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .read_only(true)
        .create_if_missing(false);

    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open bundle {}", db_path.display()))?;

    Ok(pool)
}
