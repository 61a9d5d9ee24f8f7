//! `SQLite` schema bootstrap and forward migrations.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`: safe to
//! re-run on every daemon startup. A `schema_version` row in the `meta`
//! table gates migrations: older stores are migrated forward in place,
//! idempotently; a store written by a newer build is refused rather
//! than touched.

use sqlx::SqlitePool;

use crate::{AppError, Result};

/// Version written by this build.
pub const SCHEMA_VERSION: i64 = 2;

/// Add a column to a table if it does not already exist.
///
/// Uses `PRAGMA table_info` to check column presence before issuing
/// `ALTER TABLE`, making the operation idempotent on repeated startups.
async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    alter_sql: &str,
) -> Result<()> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name = '{column}'"
    ))
    .fetch_one(pool)
    .await?;

    if count == 0 {
        sqlx::raw_sql(alter_sql).execute(pool).await?;
    }
    Ok(())
}

/// Migrations from version 1: channel topic and user avatar columns.
async fn migrate_v1_to_v2(pool: &SqlitePool) -> Result<()> {
    add_column_if_missing(
        pool,
        "channel_cache",
        "topic",
        "ALTER TABLE channel_cache ADD COLUMN topic TEXT NOT NULL DEFAULT ''",
    )
    .await?;

    add_column_if_missing(
        pool,
        "user_cache",
        "avatar_url",
        "ALTER TABLE user_cache ADD COLUMN avatar_url TEXT NOT NULL DEFAULT ''",
    )
    .await?;

    Ok(())
}

async fn stored_version(pool: &SqlitePool) -> Result<i64> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT value FROM meta WHERE key = 'schema_version'")
            .fetch_optional(pool)
            .await?;
    Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(SCHEMA_VERSION))
}

async fn write_version(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(SCHEMA_VERSION.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Apply all table definitions and pending migrations.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails or the store was
/// written by a newer schema version.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS meta (
    key             TEXT PRIMARY KEY NOT NULL,
    value           TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS channel_watermarks (
    channel_id        TEXT PRIMARY KEY NOT NULL,
    channel_name      TEXT NOT NULL DEFAULT '',
    last_processed_ts TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_messages (
    id              TEXT PRIMARY KEY NOT NULL,
    channel_id      TEXT NOT NULL,
    channel_name    TEXT NOT NULL DEFAULT '',
    user_id         TEXT NOT NULL,
    user_name       TEXT NOT NULL DEFAULT '',
    body            TEXT NOT NULL,
    thread_parent   TEXT,
    is_mention      INTEGER NOT NULL DEFAULT 0,
    is_dm           INTEGER NOT NULL DEFAULT 0,
    matched_keywords TEXT NOT NULL DEFAULT '[]',
    message_ts      TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    raw_payload     TEXT NOT NULL DEFAULT '{}',
    status          TEXT NOT NULL CHECK(status IN ('pending','approved','rejected','sent','skipped')),
    processed_at    TEXT
);

CREATE TABLE IF NOT EXISTS notified_messages (
    channel_id      TEXT NOT NULL,
    message_ts      TEXT NOT NULL,
    notified_at     TEXT NOT NULL,
    PRIMARY KEY (channel_id, message_ts)
);

CREATE TABLE IF NOT EXISTS channel_cache (
    channel_id      TEXT PRIMARY KEY NOT NULL,
    name            TEXT NOT NULL,
    purpose         TEXT NOT NULL DEFAULT '',
    topic           TEXT NOT NULL DEFAULT '',
    member_count    INTEGER NOT NULL DEFAULT 0,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_cache (
    user_id         TEXT PRIMARY KEY NOT NULL,
    user_name       TEXT NOT NULL DEFAULT '',
    display_name    TEXT NOT NULL DEFAULT '',
    real_name       TEXT NOT NULL DEFAULT '',
    email           TEXT NOT NULL DEFAULT '',
    avatar_url      TEXT NOT NULL DEFAULT '',
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_cache (
    group_id        TEXT PRIMARY KEY NOT NULL,
    handle          TEXT NOT NULL,
    name            TEXT NOT NULL DEFAULT '',
    members         TEXT NOT NULL DEFAULT '[]',
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transcripts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    meeting_id      TEXT NOT NULL,
    speaker         TEXT NOT NULL DEFAULT '',
    body            TEXT NOT NULL,
    captured_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS meeting_history (
    event_id        TEXT PRIMARY KEY NOT NULL,
    title           TEXT NOT NULL DEFAULT '',
    started_at      TEXT,
    ended_at        TEXT,
    status          TEXT NOT NULL,
    caption_count   INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_messages(status, created_at);
CREATE INDEX IF NOT EXISTS idx_pending_channel ON pending_messages(channel_id);
CREATE INDEX IF NOT EXISTS idx_channel_name ON channel_cache(name);
CREATE INDEX IF NOT EXISTS idx_user_name ON user_cache(user_name);
CREATE INDEX IF NOT EXISTS idx_group_handle ON group_cache(handle);
CREATE INDEX IF NOT EXISTS idx_transcript_meeting ON transcripts(meeting_id, id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;

    let version = stored_version(pool).await?;
    if version > SCHEMA_VERSION {
        return Err(AppError::Db(format!(
            "store schema version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    if version < 2 {
        migrate_v1_to_v2(pool).await?;
    }
    write_version(pool).await?;
    Ok(())
}
