//! Single-instance lock token: exclusive `flock` plus a PID file.
//!
//! At most one process per daemon name may hold the token. The lock is
//! held for the whole process lifetime; the PID file is removed again on
//! drop. Acquisition never blocks: a held lock fails immediately with
//! the owner's PID.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Held advisory lock for one daemon instance.
#[derive(Debug)]
pub struct LockToken {
    // Held open for the lifetime of the token; the flock dies with it.
    _lock_file: fs::File,
    pid_path: PathBuf,
}

/// Lock file path for a daemon name.
#[must_use]
pub fn lock_path(runtime_dir: &Path, daemon: &str) -> PathBuf {
    runtime_dir.join(format!("{daemon}-daemon.lock"))
}

/// PID file path for a daemon name.
#[must_use]
pub fn pid_path(runtime_dir: &Path, daemon: &str) -> PathBuf {
    runtime_dir.join(format!("{daemon}-daemon.pid"))
}

/// Read the PID recorded by a running instance, if any.
#[must_use]
pub fn read_pid(runtime_dir: &Path, daemon: &str) -> Option<u32> {
    let raw = fs::read_to_string(pid_path(runtime_dir, daemon)).ok()?;
    raw.trim().parse().ok()
}

impl LockToken {
    /// Acquire the exclusive lock for `daemon`, writing the PID file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyRunning` with the existing PID when the
    /// lock is held, `AppError::Io` on file-system failures.
    pub fn acquire(runtime_dir: &Path, daemon: &str) -> Result<Self> {
        fs::create_dir_all(runtime_dir)
            .map_err(|err| AppError::Io(format!("cannot create runtime dir: {err}")))?;

        // Open without truncating so a failed acquisition does not wipe
        // the running daemon's lock file contents.
        let lock_file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path(runtime_dir, daemon))
            .map_err(|err| AppError::Io(format!("cannot open lock file: {err}")))?;

        if lock_file.try_lock_exclusive().is_err() {
            let pid = read_pid(runtime_dir, daemon).unwrap_or(0);
            return Err(AppError::AlreadyRunning(pid));
        }

        let pid = std::process::id();
        let pid_file_path = pid_path(runtime_dir, daemon);
        let mut pid_file = fs::File::create(&pid_file_path)
            .map_err(|err| AppError::Io(format!("cannot write pid file: {err}")))?;
        writeln!(pid_file, "{pid}")
            .map_err(|err| AppError::Io(format!("cannot write pid file: {err}")))?;

        debug!(daemon, pid, "instance lock acquired");

        Ok(Self {
            _lock_file: lock_file,
            pid_path: pid_file_path,
        })
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.pid_path) {
            warn!(%err, "failed to remove pid file on release");
        }
    }
}
