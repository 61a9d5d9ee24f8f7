//! Desktop notification subsystem.
//!
//! Owned by the daemon (started in startup, torn down in shutdown) and
//! passed into components as a capability: never a process-wide
//! singleton. Delivery is best-effort; failures are logged and
//! swallowed.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

/// Notification delivery capability.
#[async_trait]
pub trait DesktopNotifier: Send + Sync {
    /// Deliver a notification with a title and message body.
    async fn notify(&self, title: &str, message: &str);
}

/// Desktop notifier backed by the session notification service.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionNotifier;

impl SessionNotifier {
    /// Construct the notifier.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DesktopNotifier for SessionNotifier {
    async fn notify(&self, title: &str, message: &str) {
        let title = title.to_owned();
        let message = message.to_owned();
        // Notification display is synchronous on some platforms; run it
        // on the blocking pool instead of the async runtime.
        tokio::task::spawn_blocking(move || {
            match notify_rust::Notification::new()
                .summary(&title)
                .body(&message)
                .appname("botfleet")
                .show()
            {
                Ok(_) => info!(%title, "desktop notification sent"),
                Err(err) => warn!(%title, %err, "desktop notification failed"),
            }
        });
    }
}

/// Notifier that drops everything; used with `--no-notify` and in tests
/// that do not assert on notifications.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullNotifier;

#[async_trait]
impl DesktopNotifier for NullNotifier {
    async fn notify(&self, _title: &str, _message: &str) {}
}

/// Recording notifier for tests.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    calls: Arc<std::sync::Mutex<Vec<(String, String)>>>,
}

impl RecordingNotifier {
    /// Construct an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(title, message)` pairs delivered so far.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DesktopNotifier for RecordingNotifier {
    async fn notify(&self, title: &str, message: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((title.to_owned(), message.to_owned()));
        }
    }
}
