//! Audio/video device allocation.
//!
//! Device setup (loopback modules, virtual sinks) is external system
//! configuration; the scheduler only asks for an allocation per
//! session and returns it on session end. Each device path has exactly
//! one owner at a time. Startup runs a best-effort orphan pass that
//! reclaims devices whose owning session is no longer alive.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{AppError, Result};

/// Devices handed to one meeting session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DeviceAllocation {
    /// Owning session ID.
    pub session_id: String,
    /// Audio sink the browser plays into.
    pub audio_sink: String,
    /// Audio source the browser captures from.
    pub audio_source: String,
    /// Video loopback device path, when video was requested.
    pub video_device: Option<String>,
    /// Sink input index for the renderer, when known.
    pub sink_input_index: Option<u32>,
}

/// Allocator capability consumed by the scheduler.
#[async_trait]
pub trait MediaAllocator: Send + Sync {
    /// Allocate a sink/source pair (and a video loopback when
    /// requested) for a session.
    async fn allocate(&self, session_id: &str, video: bool) -> Result<DeviceAllocation>;

    /// Return a session's devices.
    async fn release(&self, allocation: &DeviceAllocation) -> Result<()>;

    /// Reclaim devices owned by sessions not in `live_sessions`.
    /// Returns the number reclaimed.
    async fn reclaim_orphans(&self, live_sessions: &[String]) -> Result<u32>;
}

/// In-process allocator that names devices deterministically and
/// tracks ownership. The underlying system devices are assumed to be
/// provisioned externally.
pub struct LoopbackAllocator {
    // slot index -> owning session
    slots: Mutex<HashMap<u32, String>>,
    max_slots: u32,
}

impl LoopbackAllocator {
    /// Allocator with `max_slots` concurrent device sets.
    #[must_use]
    pub fn new(max_slots: u32) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            max_slots,
        })
    }
}

#[async_trait]
impl MediaAllocator for LoopbackAllocator {
    async fn allocate(&self, session_id: &str, video: bool) -> Result<DeviceAllocation> {
        let mut slots = self.slots.lock().await;
        let slot = (0..self.max_slots)
            .find(|i| !slots.contains_key(i))
            .ok_or_else(|| AppError::Media("no free device slots".into()))?;
        slots.insert(slot, session_id.to_owned());

        info!(session_id, slot, "devices allocated");
        Ok(DeviceAllocation {
            session_id: session_id.to_owned(),
            audio_sink: format!("meet_sink_{slot}"),
            audio_source: format!("meet_source_{slot}"),
            video_device: video.then(|| format!("/dev/video{}", 10 + slot)),
            sink_input_index: None,
        })
    }

    async fn release(&self, allocation: &DeviceAllocation) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, owner| owner != &allocation.session_id);
        if slots.len() == before {
            warn!(session_id = %allocation.session_id, "release for unknown allocation");
        }
        Ok(())
    }

    async fn reclaim_orphans(&self, live_sessions: &[String]) -> Result<u32> {
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, owner| live_sessions.contains(owner));
        let reclaimed = u32::try_from(before - slots.len()).unwrap_or(u32::MAX);
        if reclaimed > 0 {
            info!(reclaimed, "orphaned device slots reclaimed");
        }
        Ok(reclaimed)
    }
}
