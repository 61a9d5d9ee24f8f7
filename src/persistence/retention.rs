//! Retention service for time-based data purge.
//!
//! Runs once at startup and then hourly: processed messages older than
//! 24 hours and notification dedup rows older than 1 hour are deleted.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Result;

use super::db::Database;
use super::notified::NotifiedRepo;
use super::pending::PendingRepo;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);
/// Processed messages are kept for one day.
const PROCESSED_RETENTION_HOURS: i64 = 24;
/// Notification dedup rows are kept for one hour.
const NOTIFIED_RETENTION_HOURS: i64 = 1;

/// Run one purge pass.
///
/// # Errors
///
/// Returns `AppError::Db` if either delete fails.
pub async fn purge_once(db: &Arc<Database>) -> Result<(u64, u64)> {
    let pending = PendingRepo::new(Arc::clone(db));
    let notified = NotifiedRepo::new(Arc::clone(db));

    let messages = pending.purge_processed(PROCESSED_RETENTION_HOURS).await?;
    let notifications = notified.purge_older_than(NOTIFIED_RETENTION_HOURS).await?;
    if messages > 0 || notifications > 0 {
        info!(messages, notifications, "retention purge completed");
    }
    Ok((messages, notifications))
}

/// Spawn the hourly retention task, purging once immediately.
#[must_use]
pub fn spawn_retention_task(db: Arc<Database>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = purge_once(&db).await {
            error!(%err, "startup retention purge failed");
        }

        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        interval.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge_once(&db).await {
                        error!(%err, "retention purge failed");
                    }
                }
            }
        }
    })
}
