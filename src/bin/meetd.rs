#![forbid(unsafe_code)]

//! `botfleet-meetd`: calendar-driven meeting scheduler daemon.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, warn};

use botfleet::bus::SignalHub;
use botfleet::config::GlobalConfig;
use botfleet::harness::cli::{self, CommonArgs};
use botfleet::harness::{Harness, HarnessOptions};
use botfleet::meet::browser::OfflineLauncher;
use botfleet::meet::calendar::OfflineCalendar;
use botfleet::meet::daemon::MeetDaemon;
use botfleet::meet::devices::LoopbackAllocator;
use botfleet::meet::siblings::VideoClient;
use botfleet::{AppError, Result};

#[derive(Debug, Parser)]
#[command(name = "botfleet-meetd", about = "Meeting scheduler daemon", version, long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Cap on concurrently active meetings.
    #[arg(long)]
    max_parallel: Option<usize>,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = cli::init_tracing(args.common.verbose, args.common.log_format) {
        eprintln!("{err}");
        return ExitCode::from(2);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to build tokio runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(code) => ExitCode::from(code),
        Err(AppError::AlreadyRunning(pid)) => {
            eprintln!("another instance is running (pid {pid})");
            ExitCode::from(1)
        }
        Err(err) => {
            error!(%err, "meet daemon failed");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Cli) -> Result<u8> {
    let config_path = args.common.config_path();
    let mut config = GlobalConfig::load_from_path(&config_path)?;
    if let Some(max_parallel) = args.max_parallel {
        config.meet.max_parallel = max_parallel.max(1);
    }

    if let Some(code) = cli::run_control(&args.common, &config, "meet").await {
        return Ok(code);
    }

    let credentials = GlobalConfig::load_credentials(&config_path)?;
    if credentials.calendar_token.is_empty() {
        warn!("no calendar token configured; running offline");
    }

    // Calendar and browser wire clients are external collaborators;
    // without them the daemon idles on offline stand-ins.
    let allocator = LoopbackAllocator::new(
        u32::try_from(config.meet.max_parallel).unwrap_or(3),
    );

    let hub = SignalHub::new();
    let daemon = MeetDaemon::build(
        &config,
        Arc::new(OfflineCalendar),
        Arc::new(OfflineLauncher),
        allocator,
        Arc::new(VideoClient::new()),
        hub.clone(),
    )
    .await?;

    Harness::run(
        daemon,
        Arc::new(config),
        hub,
        HarnessOptions {
            bus_enabled: args.common.bus_enabled(),
        },
    )
    .await?;
    Ok(0)
}
