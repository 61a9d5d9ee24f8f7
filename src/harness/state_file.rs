//! Atomic state-file publication for bus-unaware readers.
//!
//! Each daemon owns one JSON file under the user cache directory,
//! rewritten on a 10 s cadence and on demand. Writes go to a temp file
//! in the same directory followed by a rename, so a reader always sees
//! a complete document: even across a crash mid-write.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::harness::periodic::RobustPeriodicTask;
use crate::{AppError, Result};

/// Publication cadence.
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(10);

type StateProvider = Arc<dyn Fn() -> BoxFuture<'static, Value> + Send + Sync>;

/// Write a JSON document atomically (temp file + rename).
///
/// # Errors
///
/// Returns `AppError::Io` on file-system failures.
pub fn atomic_write_json(path: &Path, value: &Value) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Io(format!("state path has no parent: {}", path.display())))?;
    std::fs::create_dir_all(parent)
        .map_err(|err| AppError::Io(format!("cannot create state dir: {err}")))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Io(format!("cannot create temp state file: {err}")))?;
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::Io(format!("state serialization failed: {err}")))?;
    tmp.write_all(rendered.as_bytes())
        .map_err(|err| AppError::Io(format!("state write failed: {err}")))?;
    tmp.persist(path)
        .map_err(|err| AppError::Io(format!("state rename failed: {err}")))?;
    Ok(())
}

/// Periodic publisher of one daemon's observable state.
pub struct StatePublisher {
    path: PathBuf,
    provider: StateProvider,
    task: Arc<RobustPeriodicTask>,
}

impl StatePublisher {
    /// Start publishing `provider`'s document to `path` every 10 s.
    pub fn spawn<F, Fut>(path: PathBuf, provider: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Value> + Send + 'static,
    {
        let provider: StateProvider = Arc::new(move || Box::pin(provider()));

        let task_path = path.clone();
        let task_provider = Arc::clone(&provider);
        let task = RobustPeriodicTask::spawn(
            "state_publisher",
            PUBLISH_INTERVAL,
            false,
            Duration::ZERO,
            move || {
                let path = task_path.clone();
                let provider = Arc::clone(&task_provider);
                async move { publish(&path, &provider).await }
            },
        );

        Arc::new(Self {
            path,
            provider,
            task,
        })
    }

    /// Publish immediately, outside the cadence.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on file-system failures.
    pub async fn publish_now(&self) -> Result<()> {
        publish(&self.path, &self.provider).await
    }

    /// Published file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the cadence task.
    pub async fn stop(&self) {
        self.task.stop().await;
    }
}

async fn publish(path: &Path, provider: &StateProvider) -> Result<()> {
    let state = provider().await;
    match atomic_write_json(path, &state) {
        Ok(()) => {
            debug!(path = %path.display(), "state published");
            Ok(())
        }
        Err(err) => {
            warn!(%err, "state publication failed");
            Err(err)
        }
    }
}
