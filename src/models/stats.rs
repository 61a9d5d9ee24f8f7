//! Derived runtime views: listener stats, sync stats, health reports.
//!
//! All of these are recomputed from live state on demand; none are
//! persisted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Listener poll counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ListenerStats {
    /// Completed poll ticks.
    pub polls: u64,
    /// Total tick-level errors.
    pub errors: u64,
    /// Errors since the last successful tick.
    pub consecutive_errors: u32,
    /// Messages observed across all channels.
    pub messages_seen: u64,
    /// Completion time of the most recent tick.
    pub last_poll_at: Option<DateTime<Utc>>,
    /// Most recent error text; cleared on success.
    pub last_error: Option<String>,
}

/// Background sync sweep counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SyncStats {
    /// Whether a sweep loop is currently running.
    pub running: bool,
    /// Conversations discovered in the current/last sweep.
    pub channels_discovered: u64,
    /// Channels fully synced (info + members).
    pub channels_synced: u64,
    /// User rows upserted.
    pub users_cached: u64,
    /// Avatar photos downloaded.
    pub photos_downloaded: u64,
    /// Avatar downloads that failed.
    pub photos_failed: u64,
    /// Provider rate-limit waits honoured (not counted as failures).
    pub rate_limited: u64,
    /// Non-rate-limit item failures.
    pub errors: u64,
    /// Start of the most recent sweep.
    pub last_sweep_started: Option<DateTime<Utc>>,
    /// Completion of the most recent full sweep.
    pub last_sweep_completed: Option<DateTime<Utc>>,
}

/// Health check payload returned by every daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HealthReport {
    /// Overall verdict; the watchdog is fed only while this is true.
    pub healthy: bool,
    /// Named cheap observations composing the verdict.
    pub checks: BTreeMap<String, bool>,
    /// Human-readable summary.
    pub message: String,
    /// Report generation time.
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Compose a report from named checks; healthy iff all pass.
    #[must_use]
    pub fn from_checks(checks: BTreeMap<String, bool>) -> Self {
        let failed: Vec<&str> = checks
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.as_str())
            .collect();
        let healthy = failed.is_empty();
        let message = if healthy {
            "ok".to_owned()
        } else {
            format!("failing: {}", failed.join(", "))
        };
        Self {
            healthy,
            checks,
            message,
            timestamp: Utc::now(),
        }
    }
}
