#![forbid(unsafe_code)]

//! `botfleet-slackd`: Slack listener / approval / cache-sync daemon.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use botfleet::bus::SignalHub;
use botfleet::config::GlobalConfig;
use botfleet::harness::cli::{self, CommonArgs};
use botfleet::harness::{Harness, HarnessOptions};
use botfleet::slack::daemon::SlackDaemon;
use botfleet::slack::notifier::{DesktopNotifier, NullNotifier, SessionNotifier};
use botfleet::slack::provider::{MessagingProvider, OfflineProvider, TemplateResponder};
use botfleet::{AppError, Result};

#[derive(Debug, Parser)]
#[command(name = "botfleet-slackd", about = "Slack listener daemon", version, long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Override the listener poll interval in seconds.
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Disable desktop notifications.
    #[arg(long)]
    no_notify: bool,
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
            error!(%err, "slack daemon failed");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Cli) -> Result<u8> {
    let config_path = args.common.config_path();
    let mut config = GlobalConfig::load_from_path(&config_path)?;
    if let Some(interval) = args.poll_interval {
        config.slack.poll_interval_secs = interval;
    }

    if let Some(code) = cli::run_control(&args.common, &config, "slack").await {
        return Ok(code);
    }

    let credentials = GlobalConfig::load_credentials(&config_path)?;
    // The wire client is an external collaborator; without one the
    // daemon idles on an offline provider.
    let provider: Arc<dyn MessagingProvider> = Arc::new(OfflineProvider);
    if credentials.slack_token.is_empty() {
        warn!("no slack token configured; running offline");
    } else {
        info!("slack token present; wire client supplied externally");
    }

    let notifier: Arc<dyn DesktopNotifier> = if args.no_notify {
        Arc::new(NullNotifier)
    } else {
        Arc::new(SessionNotifier::new())
    };

    let hub = SignalHub::new();
    let daemon = SlackDaemon::build(
        &config,
        config_path,
        provider,
        Arc::new(TemplateResponder),
        notifier,
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
