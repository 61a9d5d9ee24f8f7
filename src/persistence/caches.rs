//! Discovery cache repository: channels, users, groups.
//!
//! Caches are upsert-by-ID with no foreign keys; bulk calls run in a
//! single transaction and are idempotent. Lookups offer exact,
//! case-insensitive, substring, and fuzzy variants.

use std::sync::Arc;

use chrono::Utc;

use crate::models::cache::{CachedChannel, CachedGroup, CachedUser};
use crate::{AppError, Result};

use super::db::Database;
use super::resolve::lcs_ratio;

/// Default fuzzy-match acceptance threshold.
pub const FUZZY_THRESHOLD: f64 = 0.7;

/// Repository wrapper around `SQLite` for the discovery caches.
#[derive(Clone)]
pub struct CacheRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct ChannelRow {
    channel_id: String,
    name: String,
    purpose: String,
    topic: String,
    member_count: i64,
    updated_at: String,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    user_id: String,
    user_name: String,
    display_name: String,
    real_name: String,
    email: String,
    avatar_url: String,
    updated_at: String,
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    group_id: String,
    handle: String,
    name: String,
    members: String,
    updated_at: String,
}

fn parse_time(raw: &str, field: &str) -> Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

impl ChannelRow {
    fn into_channel(self) -> Result<CachedChannel> {
        Ok(CachedChannel {
            updated_at: parse_time(&self.updated_at, "updated_at")?,
            channel_id: self.channel_id,
            name: self.name,
            purpose: self.purpose,
            topic: self.topic,
            member_count: self.member_count,
        })
    }
}

impl UserRow {
    fn into_user(self) -> Result<CachedUser> {
        Ok(CachedUser {
            updated_at: parse_time(&self.updated_at, "updated_at")?,
            user_id: self.user_id,
            user_name: self.user_name,
            display_name: self.display_name,
            real_name: self.real_name,
            email: self.email,
            avatar_url: self.avatar_url,
        })
    }
}

impl GroupRow {
    fn into_group(self) -> Result<CachedGroup> {
        let members: Vec<String> = serde_json::from_str(&self.members)
            .map_err(|e| AppError::Db(format!("invalid group members: {e}")))?;
        Ok(CachedGroup {
            updated_at: parse_time(&self.updated_at, "updated_at")?,
            group_id: self.group_id,
            handle: self.handle,
            name: self.name,
            members,
        })
    }
}

impl CacheRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // ── Channels ────────────────────────────────────────

    /// Upsert a batch of channels in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn cache_channels(&self, channels: &[CachedChannel]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.db.begin().await?;
        for channel in channels {
            sqlx::query(
                "INSERT INTO channel_cache (channel_id, name, purpose, topic, member_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(channel_id) DO UPDATE SET
                     name = excluded.name,
                     purpose = excluded.purpose,
                     topic = excluded.topic,
                     member_count = excluded.member_count,
                     updated_at = excluded.updated_at",
            )
            .bind(&channel.channel_id)
            .bind(&channel.name)
            .bind(&channel.purpose)
            .bind(&channel.topic)
            .bind(channel.member_count)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Channel by ID.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_channel(&self, channel_id: &str) -> Result<Option<CachedChannel>> {
        let row: Option<ChannelRow> =
            sqlx::query_as("SELECT * FROM channel_cache WHERE channel_id = ?1")
                .bind(channel_id)
                .fetch_optional(self.db.as_ref())
                .await?;
        row.map(ChannelRow::into_channel).transpose()
    }

    /// Channel by name: exact first, then case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_channel_by_name(&self, name: &str) -> Result<Option<CachedChannel>> {
        let row: Option<ChannelRow> = sqlx::query_as("SELECT * FROM channel_cache WHERE name = ?1")
            .bind(name)
            .fetch_optional(self.db.as_ref())
            .await?;
        if let Some(row) = row {
            return Ok(Some(row.into_channel()?));
        }

        let row: Option<ChannelRow> =
            sqlx::query_as("SELECT * FROM channel_cache WHERE LOWER(name) = LOWER(?1) LIMIT 1")
                .bind(name)
                .fetch_optional(self.db.as_ref())
                .await?;
        row.map(ChannelRow::into_channel).transpose()
    }

    /// Case-insensitive substring search over channel names.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find_channels(&self, query: &str, limit: i64) -> Result<Vec<CachedChannel>> {
        let pattern = format!("%{}%", query.to_lowercase());
        let rows: Vec<ChannelRow> = sqlx::query_as(
            "SELECT * FROM channel_cache WHERE LOWER(name) LIKE ?1 ORDER BY name LIMIT ?2",
        )
        .bind(&pattern)
        .bind(limit)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(ChannelRow::into_channel).collect()
    }

    /// Total cached channels.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn channel_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM channel_cache")
            .fetch_one(self.db.as_ref())
            .await?)
    }

    // ── Users ───────────────────────────────────────────

    /// Upsert a batch of users in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn cache_users(&self, users: &[CachedUser]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.db.begin().await?;
        for user in users {
            sqlx::query(
                "INSERT INTO user_cache (user_id, user_name, display_name, real_name, email, avatar_url, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(user_id) DO UPDATE SET
                     user_name = excluded.user_name,
                     display_name = excluded.display_name,
                     real_name = excluded.real_name,
                     email = excluded.email,
                     avatar_url = excluded.avatar_url,
                     updated_at = excluded.updated_at",
            )
            .bind(&user.user_id)
            .bind(&user.user_name)
            .bind(&user.display_name)
            .bind(&user.real_name)
            .bind(&user.email)
            .bind(&user.avatar_url)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// User by ID.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_user(&self, user_id: &str) -> Result<Option<CachedUser>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM user_cache WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(UserRow::into_user).transpose()
    }

    /// Case-insensitive exact-then-substring search over all user name
    /// fields, best matches first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find_users(&self, query: &str, limit: i64) -> Result<Vec<CachedUser>> {
        let exact: Vec<UserRow> = sqlx::query_as(
            "SELECT * FROM user_cache
             WHERE LOWER(user_name) = LOWER(?1)
                OR LOWER(display_name) = LOWER(?1)
                OR LOWER(real_name) = LOWER(?1)
             LIMIT ?2",
        )
        .bind(query)
        .bind(limit)
        .fetch_all(self.db.as_ref())
        .await?;
        if !exact.is_empty() {
            return exact.into_iter().map(UserRow::into_user).collect();
        }

        let pattern = format!("%{}%", query.to_lowercase());
        let rows: Vec<UserRow> = sqlx::query_as(
            "SELECT * FROM user_cache
             WHERE LOWER(user_name) LIKE ?1
                OR LOWER(display_name) LIKE ?1
                OR LOWER(real_name) LIKE ?1
                OR LOWER(email) LIKE ?1
             ORDER BY user_name LIMIT ?2",
        )
        .bind(&pattern)
        .bind(limit)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(UserRow::into_user).collect()
    }

    /// Fuzzy name search using a longest-common-subsequence ratio over
    /// `user_name`, `display_name`, and `real_name`. Matches scoring at
    /// or above `threshold` are returned best-first, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find_users_fuzzy(
        &self,
        name: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<(CachedUser, f64)>> {
        if name.is_empty() {
            return Ok(Vec::new());
        }
        let needle = name.to_lowercase();
        let needle = needle.trim();

        let rows: Vec<UserRow> = sqlx::query_as("SELECT * FROM user_cache")
            .fetch_all(self.db.as_ref())
            .await?;

        let mut scored: Vec<(CachedUser, f64)> = Vec::new();
        for row in rows {
            let user = row.into_user()?;
            let score = [&user.user_name, &user.display_name, &user.real_name]
                .iter()
                .filter(|field| !field.is_empty())
                .map(|field| lcs_ratio(needle, &field.to_lowercase()))
                .fold(0.0_f64, f64::max);
            if score >= threshold {
                scored.push((user, score));
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Users whose avatar URL is known (photo sweep input).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn users_with_avatars(&self) -> Result<Vec<CachedUser>> {
        let rows: Vec<UserRow> = sqlx::query_as("SELECT * FROM user_cache WHERE avatar_url != ''")
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(UserRow::into_user).collect()
    }

    /// Total cached users.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn user_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM user_cache")
            .fetch_one(self.db.as_ref())
            .await?)
    }

    // ── Groups ──────────────────────────────────────────

    /// Upsert a batch of groups in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn cache_groups(&self, groups: &[CachedGroup]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.db.begin().await?;
        for group in groups {
            let members = serde_json::to_string(&group.members)
                .map_err(|e| AppError::Db(format!("member serialization failed: {e}")))?;
            sqlx::query(
                "INSERT INTO group_cache (group_id, handle, name, members, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(group_id) DO UPDATE SET
                     handle = excluded.handle,
                     name = excluded.name,
                     members = excluded.members,
                     updated_at = excluded.updated_at",
            )
            .bind(&group.group_id)
            .bind(&group.handle)
            .bind(&group.name)
            .bind(&members)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Group by mention handle, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_group_by_handle(&self, handle: &str) -> Result<Option<CachedGroup>> {
        let row: Option<GroupRow> =
            sqlx::query_as("SELECT * FROM group_cache WHERE LOWER(handle) = LOWER(?1) LIMIT 1")
                .bind(handle)
                .fetch_optional(self.db.as_ref())
                .await?;
        row.map(GroupRow::into_group).transpose()
    }

    /// All cached groups.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn all_groups(&self) -> Result<Vec<CachedGroup>> {
        let rows: Vec<GroupRow> = sqlx::query_as("SELECT * FROM group_cache ORDER BY handle")
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(GroupRow::into_group).collect()
    }

    /// Total cached groups.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn group_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM group_cache")
            .fetch_one(self.db.as_ref())
            .await?)
    }
}
