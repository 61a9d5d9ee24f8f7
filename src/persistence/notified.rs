//! Notification dedup repository.
//!
//! Records which message timestamps already produced a desktop alert so
//! restarts do not re-notify. Message timestamps are unique only within
//! a conversation, so rows are keyed by `(channel_id, message_ts)`.

use std::sync::Arc;

use chrono::Utc;

use crate::Result;

use super::db::Database;

/// Repository wrapper around `SQLite` for notification dedup rows.
#[derive(Clone)]
pub struct NotifiedRepo {
    db: Arc<Database>,
}

impl NotifiedRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Whether this message was already notified.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn was_notified(&self, channel_id: &str, message_ts: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notified_messages WHERE channel_id = ?1 AND message_ts = ?2",
        )
        .bind(channel_id)
        .bind(message_ts)
        .fetch_one(self.db.as_ref())
        .await?;
        Ok(count > 0)
    }

    /// Record a delivered notification. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn mark_notified(&self, channel_id: &str, message_ts: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO notified_messages (channel_id, message_ts, notified_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(channel_id, message_ts) DO NOTHING",
        )
        .bind(channel_id)
        .bind(message_ts)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Delete rows older than `hours`. Returns rows purged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_older_than(&self, hours: i64) -> Result<u64> {
        let cutoff = (Utc::now() - chrono::Duration::hours(hours)).to_rfc3339();
        let result = sqlx::query("DELETE FROM notified_messages WHERE notified_at < ?1")
            .bind(&cutoff)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}
