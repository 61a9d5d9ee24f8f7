//! Hot-reload watcher for the fleet config file.
//!
//! [`ConfigWatcher`] uses the `notify` crate to watch `config.json` for
//! file-system changes. When a change lands it re-parses the file and
//! hands the fresh [`GlobalConfig`] to a callback; daemons use this to
//! swap the reloadable sections (watched channels, keywords,
//! classifier lists) without a restart. Structural fields: paths,
//! intervals already driving running tasks: still require one.
//!
//! The callback runs inside the synchronous `notify` thread, so it
//! must stay cheap: typically a `std::sync::RwLock` write.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::config::GlobalConfig;
use crate::{AppError, Result};

/// Returns `true` for file-system events that indicate the watched file
/// was written or replaced (create, modify, remove).
fn is_config_change(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Hot-reload watcher for the fleet config file.
///
/// Holds the underlying OS watch alive for its own lifetime; dropping
/// the watcher stops hot reload.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl ConfigWatcher {
    /// Watch `path`, invoking `on_reload` with each successfully parsed
    /// new config.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the watch cannot be established.
    pub fn new<F>(path: &Path, on_reload: F) -> Result<Self>
    where
        F: Fn(GlobalConfig) + Send + 'static,
    {
        let watched = path.to_path_buf();
        let callback_path = watched.clone();

        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            match event {
                Ok(event)
                    if is_config_change(&event)
                        && (event.paths.is_empty()
                            || event.paths.iter().any(|p| p.ends_with(
                                callback_path.file_name().unwrap_or_default(),
                            ))) =>
                {
                    match GlobalConfig::load_from_path(&callback_path) {
                        Ok(config) => {
                            info!(path = %callback_path.display(), "config reloaded");
                            on_reload(config);
                        }
                        Err(err) => {
                            warn!(%err, "config change ignored; file unparseable");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "config watch error"),
            }
        })
        .map_err(|err| AppError::Config(format!("cannot create config watcher: {err}")))?;

        // Watch the parent directory: editors typically replace the file
        // by rename, which unregisters a direct file watch.
        let watch_root = path.parent().unwrap_or(path);
        watcher
            .watch(watch_root, RecursiveMode::NonRecursive)
            .map_err(|err| AppError::Config(format!("cannot watch config path: {err}")))?;

        Ok(Self {
            _watcher: watcher,
            path: watched,
        })
    }

    /// The watched file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
