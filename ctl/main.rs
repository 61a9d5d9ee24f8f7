#![forbid(unsafe_code)]

//! `botfleet-ctl`: local CLI companion for the daemon fleet.
//!
//! Connects to a daemon's bus socket and sends JSON method calls.
//! Also acts as the system sleep hook: `botfleet-ctl sleep-signal`
//! fans the login manager's prepare-for-sleep transition out to every
//! daemon.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use botfleet::bus::client::BusClient;

/// Daemons addressed by `sleep-signal` when none are named.
const FLEET: &[&str] = &["slack", "meet", "video"];

#[derive(Debug, Parser)]
#[command(
    name = "botfleet-ctl",
    about = "Local CLI for the botfleet daemons",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a daemon's status.
    Status {
        /// Daemon name (slack, meet, ...).
        daemon: String,
    },

    /// Ask a daemon to shut down gracefully.
    Stop {
        /// Daemon name.
        daemon: String,
    },

    /// Print a daemon's full observable state.
    State {
        /// Daemon name.
        daemon: String,
    },

    /// Print a daemon's health report.
    Health {
        /// Daemon name.
        daemon: String,
    },

    /// List pending approvals on the slack daemon.
    Pending,

    /// Approve a pending message by ID.
    Approve {
        /// Record ID (`channel|ts`).
        id: String,
    },

    /// Reject a pending message by ID.
    Reject {
        /// Record ID (`channel|ts`).
        id: String,
    },

    /// Approve every pending message.
    ApproveAll,

    /// Show processed-message history.
    History {
        /// Maximum records.
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },

    /// List known meetings.
    Meetings,

    /// Approve a meeting for attendance.
    ApproveMeeting {
        /// Calendar event ID.
        event_id: String,
        /// Attendance mode.
        #[arg(long, default_value = "notes")]
        mode: String,
    },

    /// Send an approved meeting back to scheduled.
    UnapproveMeeting {
        /// Calendar event ID.
        event_id: String,
    },

    /// Skip a meeting.
    SkipMeeting {
        /// Calendar event ID.
        event_id: String,
    },

    /// Join a meeting immediately, bypassing the pre-roll window.
    ForceJoin {
        /// Calendar event ID.
        event_id: String,
    },

    /// Join an ad-hoc meeting URL.
    Join {
        /// Conference URL.
        url: String,
        /// Meeting title.
        #[arg(long, default_value = "")]
        title: String,
        /// Attendance mode.
        #[arg(long, default_value = "notes")]
        mode: String,
        /// Request the rendered video persona.
        #[arg(long)]
        video: bool,
    },

    /// Leave an active meeting.
    Leave {
        /// Session ID; omit when only one meeting is active.
        session_id: Option<String>,
    },

    /// Print recent captions from active meetings.
    Captions {
        /// Maximum lines.
        #[arg(long, default_value_t = 50)]
        limit: u64,
    },

    /// Print participant rosters for active meetings.
    Participants,

    /// Fan a login-manager sleep transition out to the fleet.
    SleepSignal {
        /// The system is about to sleep (otherwise: it just woke).
        #[arg(long)]
        entering: bool,
        /// Restrict to specific daemons.
        #[arg(long, value_delimiter = ',')]
        daemons: Vec<String>,
    },

    /// Subscribe to a daemon's signals and print them.
    Watch {
        /// Daemon name.
        daemon: String,
    },

    /// Call an arbitrary method with raw JSON args.
    Call {
        /// Daemon name.
        daemon: String,
        /// Method name.
        method: String,
        /// JSON argument object.
        #[arg(default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::from(1)
        }
    }
}

async fn dispatch(command: Command) -> botfleet::Result<()> {
    match command {
        Command::Status { daemon } => call(&daemon, "get_status", json!({})).await,
        Command::Stop { daemon } => call(&daemon, "shutdown", json!({})).await,
        Command::State { daemon } => call(&daemon, "get_state", json!({})).await,
        Command::Health { daemon } => call(&daemon, "health_check", json!({})).await,
        Command::Pending => call("slack", "get_pending", json!({})).await,
        Command::Approve { id } => call("slack", "approve_message", json!({"id": id})).await,
        Command::Reject { id } => call("slack", "reject_message", json!({"id": id})).await,
        Command::ApproveAll => call("slack", "approve_all", json!({})).await,
        Command::History { limit } => call("slack", "get_history", json!({"limit": limit})).await,
        Command::Meetings => call("meet", "list_meetings", json!({})).await,
        Command::ApproveMeeting { event_id, mode } => {
            call("meet", "approve_meeting", json!({"event_id": event_id, "mode": mode})).await
        }
        Command::UnapproveMeeting { event_id } => {
            call("meet", "unapprove_meeting", json!({"event_id": event_id})).await
        }
        Command::SkipMeeting { event_id } => {
            call("meet", "skip_meeting", json!({"event_id": event_id})).await
        }
        Command::ForceJoin { event_id } => {
            call("meet", "force_join", json!({"event_id": event_id})).await
        }
        Command::Join {
            url,
            title,
            mode,
            video,
        } => {
            call(
                "meet",
                "join_meeting",
                json!({"url": url, "title": title, "mode": mode, "video_enabled": video}),
            )
            .await
        }
        Command::Leave { session_id } => {
            call(
                "meet",
                "leave_meeting",
                json!({"session_id": session_id.unwrap_or_default()}),
            )
            .await
        }
        Command::Captions { limit } => call("meet", "get_captions", json!({"limit": limit})).await,
        Command::Participants => call("meet", "get_participants", json!({})).await,
        Command::SleepSignal { entering, daemons } => {
            let targets: Vec<String> = if daemons.is_empty() {
                FLEET.iter().map(|d| (*d).to_owned()).collect()
            } else {
                daemons
            };
            for daemon in targets {
                match BusClient::connect(&daemon).await {
                    Ok(mut client) => {
                        match client
                            .call("notify_sleep", json!({"entering": entering}))
                            .await
                        {
                            Ok(_) => println!("{daemon}: signalled"),
                            Err(err) => println!("{daemon}: {err}"),
                        }
                    }
                    Err(_) => println!("{daemon}: not running"),
                }
            }
            Ok(())
        }
        Command::Watch { daemon } => {
            let mut client = BusClient::connect(&daemon).await?;
            client.subscribe().await?;
            eprintln!("watching {daemon}; ctrl-c to stop");
            loop {
                let signal = client.next_signal().await?;
                println!(
                    "{} {}",
                    signal.signal,
                    serde_json::to_string(&signal.payload).unwrap_or_default()
                );
            }
        }
        Command::Call {
            daemon,
            method,
            args,
        } => {
            let args: Value = serde_json::from_str(&args)
                .map_err(|err| botfleet::AppError::Config(format!("invalid args json: {err}")))?;
            call(&daemon, &method, args).await
        }
    }
}

/// Call one method and pretty-print its envelope.
async fn call(daemon: &str, method: &str, args: Value) -> botfleet::Result<()> {
    let mut client = BusClient::connect(daemon).await?;
    let body = client.call(method, args).await?;

    let ok = body.get("success").and_then(Value::as_bool).unwrap_or(false);
    println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    if ok {
        Ok(())
    } else {
        Err(botfleet::AppError::Bus(
            body.get("error")
                .and_then(Value::as_str)
                .unwrap_or("call failed")
                .to_owned(),
        ))
    }
}
