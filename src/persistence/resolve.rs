//! Target resolution: canonicalize an arbitrary user-supplied reference
//! (`#channel`, `@user-or-group`, raw ID, bare name) into a typed hit.

use serde::{Deserialize, Serialize};

use crate::Result;

use super::caches::{CacheRepo, FUZZY_THRESHOLD};

/// Outcome of a [`resolve_target`] lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ResolvedTarget {
    /// One of `channel`, `dm`, `user`, `group`, `unknown`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Resolved provider ID, when found.
    pub id: Option<String>,
    /// Resolved (or echoed) name.
    pub name: String,
    /// Whether any path matched.
    pub found: bool,
    /// Which lookup path matched: `raw_id`, `channel_cache`,
    /// `user_cache`, `group_cache`, or `not_found`.
    pub source: String,
}

impl ResolvedTarget {
    fn hit(kind: &str, id: String, name: String, source: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            id: Some(id),
            name,
            found: true,
            source: source.to_owned(),
        }
    }

    fn miss(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            id: None,
            name: name.to_owned(),
            found: false,
            source: "not_found".to_owned(),
        }
    }
}

/// Longest-common-subsequence similarity ratio in `[0, 1]`.
///
/// `2·lcs(a,b) / (|a| + |b|)` over characters; 1.0 for identical
/// strings, 0.0 when nothing is shared or either side is empty.
#[must_use]
pub fn lcs_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    // One-row DP over the shorter string.
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    let mut row = vec![0_usize; short.len() + 1];
    for long_ch in long.iter() {
        let mut prev_diag = 0;
        for (j, short_ch) in short.iter().enumerate() {
            let prev_row = row[j + 1];
            row[j + 1] = if long_ch == short_ch {
                prev_diag + 1
            } else {
                row[j + 1].max(row[j])
            };
            prev_diag = prev_row;
        }
    }

    let lcs = row[short.len()];
    #[allow(clippy::cast_precision_loss)]
    {
        (2.0 * lcs as f64) / ((a.len() + b.len()) as f64)
    }
}

fn looks_like_id(target: &str, prefix: char) -> bool {
    target.len() > 8
        && target.starts_with(prefix)
        && target.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Resolve a reference against the discovery caches.
///
/// Order: raw-ID prefixes, `#name` → channel, `@name` → group handle
/// then user, bare name → channel then user.
///
/// # Errors
///
/// Returns `AppError::Db` if a cache lookup fails.
pub async fn resolve_target(caches: &CacheRepo, target: &str) -> Result<ResolvedTarget> {
    let target = target.trim();

    for (prefix, kind) in [('C', "channel"), ('D', "dm"), ('U', "user"), ('S', "group")] {
        if looks_like_id(target, prefix) {
            return Ok(ResolvedTarget::hit(
                kind,
                target.to_owned(),
                target.to_owned(),
                "raw_id",
            ));
        }
    }

    if let Some(name) = target.strip_prefix('#') {
        return match caches.get_channel_by_name(name).await? {
            Some(channel) => Ok(ResolvedTarget::hit(
                "channel",
                channel.channel_id,
                channel.name,
                "channel_cache",
            )),
            None => Ok(ResolvedTarget::miss("channel", name)),
        };
    }

    if let Some(name) = target.strip_prefix('@') {
        if let Some(group) = caches.get_group_by_handle(name).await? {
            return Ok(ResolvedTarget::hit(
                "group",
                group.group_id,
                group.handle,
                "group_cache",
            ));
        }
        if let Some(user) = lookup_user(caches, name).await? {
            return Ok(ResolvedTarget::hit(
                "user",
                user.0,
                user.1,
                "user_cache",
            ));
        }
        return Ok(ResolvedTarget::miss("unknown", name));
    }

    if let Some(channel) = caches.get_channel_by_name(target).await? {
        return Ok(ResolvedTarget::hit(
            "channel",
            channel.channel_id,
            channel.name,
            "channel_cache",
        ));
    }
    if let Some(user) = lookup_user(caches, target).await? {
        return Ok(ResolvedTarget::hit("user", user.0, user.1, "user_cache"));
    }

    Ok(ResolvedTarget::miss("unknown", target))
}

/// Exact-or-substring first, fuzzy as a fallback.
async fn lookup_user(caches: &CacheRepo, name: &str) -> Result<Option<(String, String)>> {
    let direct = caches.find_users(name, 1).await?;
    if let Some(user) = direct.into_iter().next() {
        return Ok(Some((user.user_id, user.user_name)));
    }
    let fuzzy = caches.find_users_fuzzy(name, FUZZY_THRESHOLD, 1).await?;
    Ok(fuzzy
        .into_iter()
        .next()
        .map(|(user, _)| (user.user_id, user.user_name)))
}
