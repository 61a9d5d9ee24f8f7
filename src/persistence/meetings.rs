//! Meeting-side persistence: transcripts and meeting history.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::meeting::TranscriptEntry;
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for transcript rows.
#[derive(Clone)]
pub struct TranscriptRepo {
    db: Arc<Database>,
}

impl TranscriptRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append a batch of entries in capture order, one transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn append(&self, entries: &[TranscriptEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.db.begin().await?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO transcripts (meeting_id, speaker, body, captured_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&entry.meeting_id)
            .bind(&entry.speaker)
            .bind(&entry.text)
            .bind(entry.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Entries for one meeting in capture order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn for_meeting(&self, meeting_id: &str, limit: i64) -> Result<Vec<TranscriptEntry>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT meeting_id, speaker, body, captured_at FROM transcripts
             WHERE meeting_id = ?1 ORDER BY id ASC LIMIT ?2",
        )
        .bind(meeting_id)
        .bind(limit)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter()
            .map(|(meeting_id, speaker, text, captured_at)| {
                let timestamp = chrono::DateTime::parse_from_rfc3339(&captured_at)
                    .map_err(|e| AppError::Db(format!("invalid captured_at: {e}")))?
                    .with_timezone(&Utc);
                Ok(TranscriptEntry {
                    meeting_id,
                    speaker,
                    text,
                    timestamp,
                })
            })
            .collect()
    }

    /// Number of rows captured for a meeting.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count_for_meeting(&self, meeting_id: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM transcripts WHERE meeting_id = ?1")
                .bind(meeting_id)
                .fetch_one(self.db.as_ref())
                .await?,
        )
    }
}

/// A finished meeting as recorded for `get_meeting_history`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MeetingHistoryRow {
    /// Calendar event ID.
    pub event_id: String,
    /// Event title.
    pub title: String,
    /// When the bot joined, if it did.
    pub started_at: Option<DateTime<Utc>>,
    /// When the meeting ended for the bot.
    pub ended_at: Option<DateTime<Utc>>,
    /// Final meeting status (`completed` or `error`).
    pub status: String,
    /// Transcript rows captured during the session.
    pub caption_count: i64,
}

/// Repository wrapper around `SQLite` for finished meetings.
#[derive(Clone)]
pub struct MeetingHistoryRepo {
    db: Arc<Database>,
}

impl MeetingHistoryRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record (or overwrite) a finished meeting.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn record(&self, row: &MeetingHistoryRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO meeting_history (event_id, title, started_at, ended_at, status, caption_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(event_id) DO UPDATE SET
                 title = excluded.title,
                 started_at = excluded.started_at,
                 ended_at = excluded.ended_at,
                 status = excluded.status,
                 caption_count = excluded.caption_count",
        )
        .bind(&row.event_id)
        .bind(&row.title)
        .bind(row.started_at.map(|dt| dt.to_rfc3339()))
        .bind(row.ended_at.map(|dt| dt.to_rfc3339()))
        .bind(&row.status)
        .bind(row.caption_count)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Most recent finished meetings, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn recent(&self, limit: i64) -> Result<Vec<MeetingHistoryRow>> {
        let rows: Vec<(String, String, Option<String>, Option<String>, String, i64)> =
            sqlx::query_as(
                "SELECT event_id, title, started_at, ended_at, status, caption_count
                 FROM meeting_history ORDER BY ended_at DESC LIMIT ?1",
            )
            .bind(limit)
            .fetch_all(self.db.as_ref())
            .await?;

        rows.into_iter()
            .map(|(event_id, title, started_at, ended_at, status, caption_count)| {
                let parse = |raw: Option<String>, field: &str| {
                    raw.as_deref()
                        .map(|s| {
                            chrono::DateTime::parse_from_rfc3339(s)
                                .map(|dt| dt.with_timezone(&Utc))
                                .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
                        })
                        .transpose()
                };
                Ok(MeetingHistoryRow {
                    event_id,
                    title,
                    started_at: parse(started_at, "started_at")?,
                    ended_at: parse(ended_at, "ended_at")?,
                    status,
                    caption_count,
                })
            })
            .collect()
    }
}
