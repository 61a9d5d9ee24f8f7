//! Layered configuration: JSON file, environment overrides, credentials.
//!
//! The file lives at `<config_dir>/botfleet/config.json` by default and
//! can be relocated with `BOTFLEET_CONFIG`. Scalar fields may be
//! overridden with upper-snake environment variables
//! (`BOTFLEET_<SECTION>_<FIELD>`). Tokens are never read from the config
//! file itself: only from the environment or a `credentials.json`
//! sitting next to it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Classification lists for inbound message authors.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ClassifierConfig {
    /// User IDs whose messages may be auto-answered.
    pub safe_user_ids: Vec<String>,
    /// Handles treated the same as safe user IDs.
    pub safe_handles: Vec<String>,
    /// Email domains treated as safe (matched case-insensitively).
    pub safe_email_domains: Vec<String>,
    /// User IDs always routed to the approval queue.
    pub concerned_user_ids: Vec<String>,
}

/// Per-channel action mode for the listener.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    /// Generate and send responses without review.
    Auto,
    /// Queue proposed responses for human approval.
    #[default]
    Approve,
    /// Observe only; never act.
    Ignore,
}

/// Channel allow/deny lists and per-channel mode overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ChannelPermissionConfig {
    /// Mode applied when a channel has no explicit entry.
    pub default_mode: ChannelMode,
    /// Per-channel mode overrides, keyed by channel ID.
    pub modes: HashMap<String, ChannelMode>,
    /// Channels the listener must never act in. Deny wins over any mode.
    pub deny: Vec<String>,
}

/// Background cache-warmer tuning.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct SyncConfig {
    /// Interval between full sweeps, in seconds.
    pub sweep_interval_secs: u64,
    /// Lower bound of the uniform inter-channel delay.
    pub min_delay_secs: f64,
    /// Upper bound of the uniform inter-channel delay.
    pub max_delay_secs: f64,
    /// Wait after a provider rate limit before retrying.
    pub rate_limit_backoff_secs: u64,
    /// Member-fetch cap per channel.
    pub max_members_per_channel: u32,
    /// Skip direct-message conversations during the channel sweep.
    pub skip_dms: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 86_400,
            min_delay_secs: 1.0,
            max_delay_secs: 3.0,
            rate_limit_backoff_secs: 60,
            max_members_per_channel: 200,
            skip_dms: true,
        }
    }
}

/// Slack daemon section.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct SlackConfig {
    /// Listener poll interval, in seconds.
    pub poll_interval_secs: u64,
    /// Per-channel cap on messages processed in one tick.
    pub max_messages_per_tick: u32,
    /// Channel IDs the listener watches.
    pub watched_channels: Vec<String>,
    /// Lowercase keywords that flag a message.
    pub keywords: Vec<String>,
    /// The bot's own user ID, used for mention detection and self-skip.
    pub self_user_id: String,
    /// Bound on the pending approval queue.
    pub max_pending: usize,
    /// Bound on the processed-record history ring.
    pub history_size: usize,
    /// Consecutive listener errors before health degrades.
    pub max_consecutive_errors: u32,
    /// Author classification lists.
    pub classifier: ClassifierConfig,
    /// Channel permission gates.
    pub channels: ChannelPermissionConfig,
    /// Background sync tuning.
    pub sync: SyncConfig,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_messages_per_tick: 50,
            watched_channels: Vec::new(),
            keywords: Vec::new(),
            self_user_id: String::new(),
            max_pending: 100,
            history_size: 1000,
            max_consecutive_errors: 10,
            classifier: ClassifierConfig::default(),
            channels: ChannelPermissionConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// One calendar the scheduler polls.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CalendarEntry {
    /// Provider-side calendar identifier.
    pub calendar_id: String,
    /// Human-readable name for state files and logs.
    pub display_name: String,
    /// Disabled calendars are skipped entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Auto-approve meetings from this calendar at ingest.
    #[serde(default)]
    pub auto_join: bool,
    /// Bot mode applied to auto-approved meetings.
    #[serde(default = "default_bot_mode")]
    pub bot_mode: String,
}

fn default_true() -> bool {
    true
}

fn default_bot_mode() -> String {
    "notes".to_owned()
}

/// Meeting scheduler section.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct MeetConfig {
    /// Calendar poll interval, in seconds.
    pub poll_interval_secs: u64,
    /// State machine evaluation interval, in seconds.
    pub tick_interval_secs: u64,
    /// How far ahead to project meetings, in hours.
    pub look_ahead_hours: u64,
    /// Seconds before scheduled start to begin joining.
    pub pre_roll_secs: u64,
    /// Seconds after scheduled end before auto-leave.
    pub grace_secs: u64,
    /// Cap on concurrently active meetings.
    pub max_parallel: usize,
    /// Wall-clock bound on one browser join attempt, in seconds.
    pub join_attempt_timeout_secs: u64,
    /// Calendars to poll.
    pub calendars: Vec<CalendarEntry>,
    /// Transcript flush trigger: buffered entries.
    pub transcript_flush_entries: usize,
    /// Transcript flush trigger: elapsed seconds.
    pub transcript_flush_secs: u64,
}

impl Default for MeetConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            tick_interval_secs: 5,
            look_ahead_hours: 24,
            pre_roll_secs: 30,
            grace_secs: 300,
            max_parallel: 3,
            join_attempt_timeout_secs: 45,
            calendars: Vec::new(),
            transcript_flush_entries: 10,
            transcript_flush_secs: 30,
        }
    }
}

/// Secrets loaded from the environment or `credentials.json`.
///
/// Deliberately excluded from `GlobalConfig` serialization so tokens can
/// never leak into state files or logs.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Credentials {
    /// Messaging provider token.
    pub slack_token: String,
    /// Calendar provider token.
    pub calendar_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("slack_token", &"<redacted>")
            .field("calendar_token", &"<redacted>")
            .finish()
    }
}

/// Global configuration shared by every daemon in the fleet.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct GlobalConfig {
    /// Persistent data directory (SQLite stores, photo cache).
    pub data_dir: PathBuf,
    /// Cache directory for published state files.
    pub cache_dir: PathBuf,
    /// Runtime directory for lock and PID files.
    pub runtime_dir: PathBuf,
    /// Slack daemon settings.
    pub slack: SlackConfig,
    /// Meeting scheduler settings.
    pub meet: MeetConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("botfleet");
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("botfleet");
        let runtime_dir = dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("botfleet");
        Self {
            data_dir,
            cache_dir,
            runtime_dir,
            slack: SlackConfig::default(),
            meet: MeetConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Default config file path, honouring `BOTFLEET_CONFIG`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("BOTFLEET_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("botfleet")
            .join("config.json")
    }

    /// Load configuration from a JSON file, then apply env overrides.
    ///
    /// A missing file yields the built-in defaults; a present but
    /// unparseable file is a hard error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file exists but cannot be read
    /// or parsed, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)
                .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
            Self::from_json_str(&raw)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(raw)
            .map_err(|err| AppError::Config(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay upper-snake environment variables on scalar fields.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u64("BOTFLEET_SLACK_POLL_INTERVAL_SECS") {
            self.slack.poll_interval_secs = v;
        }
        if let Some(v) = env_u64("BOTFLEET_SLACK_MAX_PENDING") {
            self.slack.max_pending = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = env_u64("BOTFLEET_MEET_POLL_INTERVAL_SECS") {
            self.meet.poll_interval_secs = v;
        }
        if let Some(v) = env_u64("BOTFLEET_MEET_MAX_PARALLEL") {
            self.meet.max_parallel = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = env_u64("BOTFLEET_MEET_GRACE_SECS") {
            self.meet.grace_secs = v;
        }
        if let Ok(v) = std::env::var("BOTFLEET_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BOTFLEET_CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BOTFLEET_RUNTIME_DIR") {
            self.runtime_dir = PathBuf::from(v);
        }
    }

    /// Load credentials from the environment, falling back to a
    /// `credentials.json` next to the given config path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the credentials file exists but is
    /// unparseable. Absent tokens are not an error here; each daemon
    /// decides at startup whether its token is mandatory.
    pub fn load_credentials(config_path: &Path) -> Result<Credentials> {
        let mut creds = Credentials::default();

        let creds_path = config_path.with_file_name("credentials.json");
        if creds_path.exists() {
            let raw = fs::read_to_string(&creds_path)
                .map_err(|err| AppError::Config(format!("failed to read credentials: {err}")))?;
            creds = serde_json::from_str(&raw)
                .map_err(|err| AppError::Config(format!("invalid credentials file: {err}")))?;
        }

        if let Ok(token) = std::env::var("SLACK_TOKEN") {
            creds.slack_token = token;
        }
        if let Ok(token) = std::env::var("CALENDAR_TOKEN") {
            creds.calendar_token = token;
        }
        Ok(creds)
    }

    /// SQLite store path for a daemon.
    #[must_use]
    pub fn db_path(&self, daemon: &str) -> PathBuf {
        self.data_dir.join(format!("{daemon}.db"))
    }

    /// Avatar photo cache directory.
    #[must_use]
    pub fn photo_dir(&self) -> PathBuf {
        self.data_dir.join("photos")
    }

    /// Published state file for a daemon.
    #[must_use]
    pub fn state_file(&self, daemon: &str) -> PathBuf {
        self.cache_dir.join(format!("{daemon}_state.json"))
    }

    fn validate(&mut self) -> Result<()> {
        if self.meet.max_parallel == 0 {
            return Err(AppError::Config(
                "meet.max_parallel must be greater than zero".into(),
            ));
        }
        if self.slack.max_pending == 0 {
            return Err(AppError::Config(
                "slack.max_pending must be greater than zero".into(),
            ));
        }
        if self.slack.sync.min_delay_secs > self.slack.sync.max_delay_secs {
            return Err(AppError::Config(
                "slack.sync.min_delay_secs must not exceed max_delay_secs".into(),
            ));
        }
        Ok(())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
