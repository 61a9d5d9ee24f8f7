//! Narrow bus client for sibling media daemons.
//!
//! The video renderer is another daemon on the fleet bus. It may not be
//! up yet (or at all) when the scheduler needs it; absence is a
//! non-fatal warning and the meeting continues audio-only.

use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::bus::client::BusClient;
use crate::meet::devices::DeviceAllocation;

/// Client for the video renderer daemon.
pub struct VideoClient {
    daemon: String,
}

impl VideoClient {
    /// Client for the well-known video daemon name.
    #[must_use]
    pub fn new() -> Self {
        Self {
            daemon: "video".to_owned(),
        }
    }

    /// Client for an explicit daemon name (tests use scratch names).
    #[must_use]
    pub fn for_daemon(daemon: impl Into<String>) -> Self {
        Self {
            daemon: daemon.into(),
        }
    }

    /// Ask the renderer to start feeding the loopback device.
    ///
    /// Returns `false` (with a warning) when the renderer is absent or
    /// refuses; the caller continues audio-only.
    pub async fn start_video(
        &self,
        allocation: &DeviceAllocation,
        width: u32,
        height: u32,
        flip: bool,
    ) -> bool {
        let Some(device) = allocation.video_device.as_deref() else {
            return false;
        };
        let args = json!({
            "device_path": device,
            "audio_input": allocation.audio_source,
            "audio_output": allocation.audio_sink,
            "width": width,
            "height": height,
            "flip": flip,
            "sink_input_index": allocation.sink_input_index,
        });
        match self.call("start_video", args).await {
            Some(body) if body.get("success").and_then(JsonValue::as_bool) == Some(true) => true,
            Some(body) => {
                warn!(
                    error = %body.get("error").and_then(JsonValue::as_str).unwrap_or("unknown"),
                    "video renderer refused start_video; continuing audio-only"
                );
                false
            }
            None => false,
        }
    }

    /// Ask the renderer to stop.
    pub async fn stop_video(&self) {
        let _ = self.call("stop_video", json!({})).await;
    }

    /// Forward the current participant roster to the renderer.
    pub async fn update_attendees(&self, participants: &[String]) {
        let _ = self
            .call("update_attendees", json!({"attendees": participants}))
            .await;
    }

    async fn call(&self, method: &str, args: JsonValue) -> Option<JsonValue> {
        match BusClient::connect_once(&self.daemon).await {
            Ok(mut client) => match client.call(method, args).await {
                Ok(body) => Some(body),
                Err(err) => {
                    warn!(daemon = %self.daemon, method, %err, "sibling call failed");
                    None
                }
            },
            Err(err) => {
                debug!(daemon = %self.daemon, method, %err, "sibling daemon absent");
                None
            }
        }
    }
}

impl Default for VideoClient {
    fn default() -> Self {
        Self::new()
    }
}
