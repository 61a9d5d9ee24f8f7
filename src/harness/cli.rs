//! Uniform CLI surface shared by every daemon binary.
//!
//! Flags: `--status` (print PID or "not running"; exit 0/1), `--stop`
//! (SIGTERM the running PID), `--verbose/-v`, `--bus/--no-bus`,
//! `--config`, `--log-format`. Daemon-specific flags are added per
//! binary via `#[command(flatten)]`.

use std::path::PathBuf;

use clap::{ArgAction, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use crate::bus::client::peer_alive;
use crate::config::GlobalConfig;
use crate::harness::lock;
use crate::{AppError, Result};

/// Log output format.
#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text.
    Text,
    /// Structured JSON lines.
    Json,
}

/// Flags common to every daemon binary.
#[derive(Debug, clap::Args)]
pub struct CommonArgs {
    /// Print the daemon's PID (and bus liveness) and exit.
    #[arg(long)]
    pub status: bool,

    /// Send SIGTERM to the running instance and exit.
    #[arg(long)]
    pub stop: bool,

    /// Verbose logging (debug level).
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Start the bus server (the default).
    #[arg(long = "bus", action = ArgAction::SetTrue, overrides_with = "no_bus")]
    pub bus: bool,

    /// Run without the bus server.
    #[arg(long = "no-bus", action = ArgAction::SetTrue)]
    pub no_bus: bool,

    /// Path to the JSON configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl CommonArgs {
    /// Whether the bus server should start.
    #[must_use]
    pub fn bus_enabled(&self) -> bool {
        !self.no_bus
    }

    /// Resolved config file path.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(GlobalConfig::default_path)
    }
}

/// Initialize the tracing subscriber.
///
/// # Errors
///
/// Returns `AppError::Config` if a subscriber is already installed.
pub fn init_tracing(verbose: bool, format: LogFormat) -> Result<()> {
    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = fmt().with_env_filter(env_filter);

    match format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }
    Ok(())
}

/// Handle `--status` / `--stop` before any lock acquisition.
///
/// Returns the process exit code when one of the control flags was
/// given, `None` when the daemon should start normally.
pub async fn run_control(args: &CommonArgs, config: &GlobalConfig, daemon: &str) -> Option<u8> {
    if args.status {
        return Some(print_status(config, daemon).await);
    }
    if args.stop {
        return Some(stop_running(config, daemon));
    }
    None
}

async fn print_status(config: &GlobalConfig, daemon: &str) -> u8 {
    match lock::read_pid(&config.runtime_dir, daemon) {
        Some(pid) => {
            let on_bus = peer_alive(daemon).await;
            if on_bus {
                println!("running (pid {pid}, bus responsive)");
            } else {
                println!("running (pid {pid}, bus unresponsive)");
            }
            0
        }
        None => {
            println!("not running");
            1
        }
    }
}

#[cfg(unix)]
fn stop_running(config: &GlobalConfig, daemon: &str) -> u8 {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match lock::read_pid(&config.runtime_dir, daemon) {
        Some(pid) => {
            let Ok(raw) = i32::try_from(pid) else {
                eprintln!("implausible pid {pid}");
                return 1;
            };
            match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                Ok(()) => {
                    println!("sent SIGTERM to pid {pid}");
                    0
                }
                Err(err) => {
                    eprintln!("failed to signal pid {pid}: {err}");
                    1
                }
            }
        }
        None => {
            println!("not running");
            1
        }
    }
}

#[cfg(not(unix))]
fn stop_running(_config: &GlobalConfig, _daemon: &str) -> u8 {
    eprintln!("--stop is only supported on unix");
    1
}
