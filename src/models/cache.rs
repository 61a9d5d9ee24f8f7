//! Discovery cache records: channels, users, groups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cached conversation from the provider sidebar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CachedChannel {
    /// Provider channel ID.
    pub channel_id: String,
    /// Channel name without the `#` sigil.
    pub name: String,
    /// Channel purpose text, if any.
    pub purpose: String,
    /// Channel topic text, if any.
    pub topic: String,
    /// Member count reported at sync time.
    pub member_count: i64,
    /// Last upsert time.
    pub updated_at: DateTime<Utc>,
}

/// A cached workspace user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CachedUser {
    /// Provider user ID.
    pub user_id: String,
    /// Login name.
    pub user_name: String,
    /// Preferred display name; falls back to `user_name`.
    pub display_name: String,
    /// Full real name, if published.
    pub real_name: String,
    /// Work email, if published.
    pub email: String,
    /// Avatar image URL; empty when none.
    pub avatar_url: String,
    /// Last upsert time.
    pub updated_at: DateTime<Utc>,
}

/// A cached user group (handle plus ordered member list).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CachedGroup {
    /// Provider group ID.
    pub group_id: String,
    /// Mention handle without the `@` sigil.
    pub handle: String,
    /// Display name.
    pub name: String,
    /// Ordered member user IDs.
    pub members: Vec<String>,
    /// Last upsert time.
    pub updated_at: DateTime<Utc>,
}
