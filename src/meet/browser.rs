//! Browser collaborator surface.
//!
//! The actual automation against the conferencing page lives outside
//! this crate; the scheduler consumes joins, caption streams,
//! participant rosters, and mute control through these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::meet::devices::DeviceAllocation;
use crate::Result;

/// One caption line from the conference page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CaptionEntry {
    /// Speaker name as rendered by the page.
    pub speaker: String,
    /// Caption text.
    pub text: String,
    /// Capture time.
    pub captured_at: DateTime<Utc>,
}

/// A live browser session in one meeting.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Leave the meeting and close the page.
    async fn leave(&self) -> Result<()>;

    /// Current participant roster.
    async fn participants(&self) -> Result<Vec<String>>;

    /// Take the caption stream. Yields entries as the page renders
    /// them; may be taken at most once per session.
    async fn take_captions(&self) -> Option<mpsc::Receiver<CaptionEntry>>;

    /// Mute the bot's microphone.
    async fn mute(&self) -> Result<()>;

    /// Unmute the bot's microphone.
    async fn unmute(&self) -> Result<()>;

    /// Whether the page/window has gone away.
    async fn is_closed(&self) -> bool;
}

/// Launches browser sessions; one call per join attempt.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Join a meeting URL with the allocated media devices.
    async fn join(
        &self,
        url: &str,
        devices: &DeviceAllocation,
    ) -> Result<Box<dyn BrowserHandle>>;
}

/// Launcher stand-in used when no browser collaborator is configured;
/// joins always fail.
pub struct OfflineLauncher;

#[async_trait]
impl BrowserLauncher for OfflineLauncher {
    async fn join(
        &self,
        _url: &str,
        _devices: &DeviceAllocation,
    ) -> Result<Box<dyn BrowserHandle>> {
        Err(crate::AppError::Media(
            "browser collaborator not configured".into(),
        ))
    }
}
