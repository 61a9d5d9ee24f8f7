//! Pending message repository.
//!
//! Rows are created when the listener first sees a message and change
//! exactly twice at most: one forward status transition plus its
//! `processed_at` stamp. Transitions outside the allowed edges are
//! rejected.

use std::sync::Arc;

use chrono::Utc;

use crate::models::message::{MessageStatus, PendingMessage};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for pending message records.
#[derive(Clone)]
pub struct PendingRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct PendingRow {
    id: String,
    channel_id: String,
    channel_name: String,
    user_id: String,
    user_name: String,
    body: String,
    thread_parent: Option<String>,
    is_mention: i64,
    is_dm: i64,
    matched_keywords: String,
    message_ts: String,
    created_at: String,
    raw_payload: String,
    status: String,
    processed_at: Option<String>,
}

impl PendingRow {
    fn into_message(self) -> Result<PendingMessage> {
        let status = MessageStatus::parse(&self.status)
            .ok_or_else(|| AppError::Db(format!("invalid status: {}", self.status)))?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);
        let processed_at = self
            .processed_at
            .as_deref()
            .map(|s| {
                chrono::DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| AppError::Db(format!("invalid processed_at: {e}")))
            })
            .transpose()?;
        let matched_keywords: Vec<String> = serde_json::from_str(&self.matched_keywords)
            .map_err(|e| AppError::Db(format!("invalid matched_keywords: {e}")))?;

        Ok(PendingMessage {
            id: self.id,
            channel_id: self.channel_id,
            channel_name: self.channel_name,
            user_id: self.user_id,
            user_name: self.user_name,
            text: self.body,
            thread_parent: self.thread_parent,
            is_mention: self.is_mention != 0,
            is_dm: self.is_dm != 0,
            matched_keywords,
            timestamp: self.message_ts,
            created_at,
            raw_payload: self.raw_payload,
            status,
            processed_at,
        })
    }
}

impl PendingRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new message record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails (including duplicate
    /// IDs: the listener checks `exists` first).
    pub async fn insert(&self, message: &PendingMessage) -> Result<()> {
        let keywords = serde_json::to_string(&message.matched_keywords)
            .map_err(|e| AppError::Db(format!("keyword serialization failed: {e}")))?;

        sqlx::query(
            "INSERT INTO pending_messages
             (id, channel_id, channel_name, user_id, user_name, body, thread_parent,
              is_mention, is_dm, matched_keywords, message_ts, created_at, raw_payload,
              status, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )
        .bind(&message.id)
        .bind(&message.channel_id)
        .bind(&message.channel_name)
        .bind(&message.user_id)
        .bind(&message.user_name)
        .bind(&message.text)
        .bind(&message.thread_parent)
        .bind(i64::from(message.is_mention))
        .bind(i64::from(message.is_dm))
        .bind(&keywords)
        .bind(&message.timestamp)
        .bind(message.created_at.to_rfc3339())
        .bind(&message.raw_payload)
        .bind(message.status.as_str())
        .bind(message.processed_at.map(|dt| dt.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Whether a record with this ID exists.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn exists(&self, id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_messages WHERE id = ?1")
            .bind(id)
            .fetch_one(self.db.as_ref())
            .await?;
        Ok(count > 0)
    }

    /// Retrieve a record by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, id: &str) -> Result<Option<PendingMessage>> {
        let row: Option<PendingRow> = sqlx::query_as("SELECT * FROM pending_messages WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(PendingRow::into_message).transpose()
    }

    /// Apply a forward status transition, stamping `processed_at` when
    /// the new status is terminal.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown IDs and
    /// `AppError::InvalidTransition` for disallowed edges; the row is
    /// left untouched in both cases.
    pub async fn transition(&self, id: &str, next: MessageStatus) -> Result<PendingMessage> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message {id}")))?;

        if !current.status.can_transition(next) {
            return Err(AppError::InvalidTransition(format!(
                "message {id}: {} -> {}",
                current.status.as_str(),
                next.as_str()
            )));
        }

        let processed_at = match next {
            MessageStatus::Pending | MessageStatus::Approved => None,
            _ => Some(Utc::now()),
        };

        sqlx::query("UPDATE pending_messages SET status = ?1, processed_at = ?2 WHERE id = ?3")
            .bind(next.as_str())
            .bind(processed_at.map(|dt| dt.to_rfc3339()))
            .bind(id)
            .execute(self.db.as_ref())
            .await?;

        let mut updated = current;
        updated.status = next;
        updated.processed_at = processed_at;
        Ok(updated)
    }

    /// Records with a given status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_status(
        &self,
        status: MessageStatus,
        limit: i64,
    ) -> Result<Vec<PendingMessage>> {
        let rows: Vec<PendingRow> = sqlx::query_as(
            "SELECT * FROM pending_messages WHERE status = ?1
             ORDER BY created_at ASC, message_ts ASC LIMIT ?2",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(PendingRow::into_message).collect()
    }

    /// Number of records still pending.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn pending_count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pending_messages WHERE status = 'pending'")
                .fetch_one(self.db.as_ref())
                .await?;
        Ok(count)
    }

    /// Delete processed records older than `hours`. Returns rows purged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_processed(&self, hours: i64) -> Result<u64> {
        let cutoff = (Utc::now() - chrono::Duration::hours(hours)).to_rfc3339();
        let result = sqlx::query(
            "DELETE FROM pending_messages
             WHERE status != 'pending' AND processed_at IS NOT NULL AND processed_at < ?1",
        )
        .bind(&cutoff)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }
}
