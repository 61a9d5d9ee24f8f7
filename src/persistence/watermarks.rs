//! Per-channel watermark repository.
//!
//! A watermark is the last processed upstream timestamp for a channel.
//! Timestamps are opaque lexicographic strings assigned by the
//! provider; the repository enforces that a channel's watermark never
//! moves backwards, across ticks, restarts, and wakes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::Result;

use super::db::Database;

/// Repository wrapper around `SQLite` for channel watermarks.
#[derive(Clone)]
pub struct WatermarkRepo {
    db: Arc<Database>,
}

impl WatermarkRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Last processed timestamp for a channel, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, channel_id: &str) -> Result<Option<String>> {
        let ts: Option<String> = sqlx::query_scalar(
            "SELECT last_processed_ts FROM channel_watermarks WHERE channel_id = ?1",
        )
        .bind(channel_id)
        .fetch_optional(self.db.as_ref())
        .await?;
        Ok(ts)
    }

    /// Advance a channel's watermark.
    ///
    /// A timestamp at or below the stored one is silently ignored: the
    /// watermark is monotonic by construction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn advance(&self, channel_id: &str, channel_name: &str, ts: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO channel_watermarks (channel_id, channel_name, last_processed_ts, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(channel_id) DO UPDATE SET
                 channel_name = excluded.channel_name,
                 last_processed_ts = excluded.last_processed_ts,
                 updated_at = excluded.updated_at
             WHERE excluded.last_processed_ts > channel_watermarks.last_processed_ts",
        )
        .bind(channel_id)
        .bind(channel_name)
        .bind(ts)
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// All watermarks, keyed by channel ID.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn all(&self) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT channel_id, last_processed_ts FROM channel_watermarks")
                .fetch_all(self.db.as_ref())
                .await?;
        Ok(rows.into_iter().collect())
    }
}
