//! `SQLite` connections for the per-daemon stores.
//!
//! Every daemon owns exactly one store file and opens it with a
//! single-connection pool, so all writes are serialized by
//! construction. WAL keeps concurrent readers (the `--status` probe,
//! ad-hoc inspection) from blocking the writer.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::{AppError, Result};

use super::schema;

/// Alias for the shared `SQLite` connection pool.
pub type Database = SqlitePool;

/// Wait this long on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn writer_options(opts: SqliteConnectOptions) -> SqliteConnectOptions {
    opts.journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
}

/// Open (creating if necessary) a daemon's store file and bring its
/// schema up to date.
///
/// # Errors
///
/// Returns `AppError::Db` when the file cannot be opened or the schema
/// bootstrap fails.
pub async fn connect(path: &str) -> Result<Database> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| AppError::Db(format!("failed to create db dir: {err}")))?;
    }

    let opts = SqliteConnectOptions::from_str(path)
        .map_err(|err| AppError::Db(format!("invalid db path: {err}")))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(writer_options(opts))
        .await?;

    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}

/// Open a fresh in-memory store with the full schema applied.
///
/// The pool pins one connection open (`min_connections(1)`); an
/// in-memory database vanishes the moment its last connection closes.
///
/// # Errors
///
/// Returns `AppError::Db` when the schema bootstrap fails.
pub async fn connect_memory() -> Result<Database> {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|err| AppError::Db(format!("invalid memory uri: {err}")))?;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .connect_with(opts)
        .await?;

    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}
