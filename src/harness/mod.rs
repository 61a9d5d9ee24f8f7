//! Daemon lifecycle harness.
//!
//! Every daemon in the fleet gets identical behaviour from
//! [`Harness::run`]: single-instance locking, bus registration,
//! sleep/wake monitoring, service-manager notification, state-file
//! publication, signal handling, and ordered teardown. Daemons
//! implement the [`Daemon`] trait and provide only their own startup,
//! main loop, shutdown, and bus methods.

pub mod cli;
pub mod lock;
pub mod periodic;
pub mod sleep_wake;
pub mod state_file;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::server::BusServer;
use crate::bus::{self, envelope_err, envelope_ok, MethodRegistry, SignalHub};
use crate::config::GlobalConfig;
use crate::models::stats::HealthReport;
use crate::{AppError, Result};

use lock::LockToken;
use sleep_wake::SleepWakeMonitor;
use state_file::StatePublisher;

/// Cap on the whole startup sequence.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Cap on the whole shutdown sequence.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed identity of one daemon: name, bus name, object path.
#[derive(Debug, Clone)]
pub struct DaemonIdentity {
    /// Short daemon name (`slack`, `meet`).
    pub name: String,
    /// Well-known bus name (`com.example.BotSlack`).
    pub bus_name: String,
    /// Object path mirroring the bus name.
    pub object_path: String,
    /// Local socket backing the bus name.
    pub socket: String,
}

impl DaemonIdentity {
    /// Derive the full identity from the short name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            bus_name: bus::bus_name(name),
            object_path: bus::object_path(name),
            socket: bus::socket_name(name),
        }
    }
}

/// Contract implemented by every daemon in the fleet.
#[async_trait]
pub trait Daemon: Send + Sync + 'static {
    /// The daemon's fixed identity.
    fn identity(&self) -> &DaemonIdentity;

    /// Acquire resources. Idempotent; failure is fatal.
    async fn startup(&self) -> Result<()>;

    /// Main cooperative loop; returns only when `shutdown` fires.
    async fn run_daemon(&self, shutdown: CancellationToken) -> Result<()>;

    /// Release every resource acquired in startup, in reverse order,
    /// even if startup partially failed. Idempotent.
    async fn shutdown(&self);

    /// Called once per system wake event.
    async fn on_system_wake(&self);

    /// Called when the system prepares for sleep.
    async fn on_system_sleep(&self) {}

    /// Cheap composed health observations.
    async fn health_check(&self) -> HealthReport;

    /// Attach the daemon's domain methods to the bus registry.
    fn register_methods(&self, registry: &mut MethodRegistry);

    /// The observable state document published to the state file.
    /// Must carry `updated_at` and `status`; must never carry secrets.
    async fn current_state(&self) -> Value;

    /// Runtime counters for the `Stats` property. Must not block.
    fn stats(&self) -> Value;
}

/// Harness run options, derived from the uniform CLI surface.
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    /// Start the bus server (disabled with `--no-bus`).
    pub bus_enabled: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self { bus_enabled: true }
    }
}

/// The lifecycle harness. See [`Harness::run`].
pub struct Harness;

impl Harness {
    /// Blocking daemon entry point.
    ///
    /// Order: lock → sleep/wake monitor → bus → watchdog → `startup()`
    /// → READY → `run_daemon()` → reverse-order teardown. Startup
    /// failure tears down and propagates; the caller exits non-zero.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyRunning` when another instance holds
    /// the lock, or whatever `startup()`/`run_daemon()` fail with.
    pub async fn run(
        daemon: Arc<dyn Daemon>,
        config: Arc<GlobalConfig>,
        hub: SignalHub,
        options: HarnessOptions,
    ) -> Result<()> {
        let identity = daemon.identity().clone();
        let _lock = LockToken::acquire(&config.runtime_dir, &identity.name)?;
        info!(daemon = %identity.name, bus = %identity.bus_name, "harness starting");

        let shutdown = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(false));
        let started_at = Instant::now();

        // Sleep/wake monitor, wired to the daemon's hooks.
        let monitor = {
            let wake_daemon = Arc::clone(&daemon);
            let sleep_daemon = Arc::clone(&daemon);
            SleepWakeMonitor::spawn(
                move || {
                    let daemon = Arc::clone(&wake_daemon);
                    async move { daemon.on_system_wake().await }
                },
                move || {
                    let daemon = Arc::clone(&sleep_daemon);
                    async move { daemon.on_system_sleep().await }
                },
            )
        };

        // State publisher (cadence task; first write after one interval).
        let publisher = {
            let daemon = Arc::clone(&daemon);
            StatePublisher::spawn(config.state_file(&identity.name), move || {
                let daemon = Arc::clone(&daemon);
                async move { daemon.current_state().await }
            })
        };

        // Bus registry: built-ins first so daemons may override.
        let bus_server = if options.bus_enabled {
            let mut registry = MethodRegistry::new();
            register_builtins(
                &mut registry,
                &daemon,
                &identity,
                &shutdown,
                &running,
                started_at,
                &monitor,
                &publisher,
            );
            daemon.register_methods(&mut registry);
            Some(BusServer::spawn(
                &identity.socket,
                registry,
                hub.clone(),
                shutdown.child_token(),
            )?)
        } else {
            info!("bus disabled");
            None
        };

        // Watchdog feeding, gated on health.
        let watchdog = spawn_watchdog(Arc::clone(&daemon), shutdown.clone());

        // Startup under the global cap.
        match tokio::time::timeout(STARTUP_TIMEOUT, daemon.startup()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(%err, "startup failed");
                daemon.shutdown().await;
                shutdown.cancel();
                return Err(err);
            }
            Err(_) => {
                error!("startup timed out");
                daemon.shutdown().await;
                shutdown.cancel();
                return Err(AppError::Timeout("startup".into()));
            }
        }

        running.store(true, Ordering::SeqCst);
        notify_ready();
        hub.emit("StatusChanged", json!("running"));
        info!(daemon = %identity.name, "daemon running");

        spawn_signal_listener(shutdown.clone());

        let result = daemon.run_daemon(shutdown.clone()).await;

        // ── Teardown, reverse order ─────────────────────────
        running.store(false, Ordering::SeqCst);
        hub.emit("StatusChanged", json!("stopping"));
        notify_stopping();

        let teardown = async {
            publisher.stop().await;
            daemon.shutdown().await;
            monitor.stop().await;
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, teardown).await.is_err() {
            error!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "graceful shutdown timed out"
            );
        }

        shutdown.cancel();
        watchdog.abort();
        if let Some(server) = bus_server {
            server.join().await;
        }

        info!(daemon = %identity.name, "daemon stopped");
        result
    }
}

#[allow(clippy::too_many_arguments)] // One-time wiring of the built-in surface.
fn register_builtins(
    registry: &mut MethodRegistry,
    daemon: &Arc<dyn Daemon>,
    identity: &DaemonIdentity,
    shutdown: &CancellationToken,
    running: &Arc<AtomicBool>,
    started_at: Instant,
    monitor: &Arc<SleepWakeMonitor>,
    publisher: &Arc<StatePublisher>,
) {
    // Properties: must answer without touching external I/O.
    {
        let running = Arc::clone(running);
        registry.register_property("Running", move || json!(running.load(Ordering::SeqCst)));
    }
    {
        let daemon = Arc::clone(daemon);
        registry.register_property("Stats", move || {
            json!(daemon.stats().to_string())
        });
    }

    {
        let running = Arc::clone(running);
        let monitor = Arc::clone(monitor);
        let name = identity.name.clone();
        let bus_name = identity.bus_name.clone();
        registry.register("get_status", move |_args| {
            let running = Arc::clone(&running);
            let monitor = Arc::clone(&monitor);
            let name = name.clone();
            let bus_name = bus_name.clone();
            async move {
                let status = if running.load(Ordering::SeqCst) {
                    "running"
                } else {
                    "starting"
                };
                envelope_ok(json!({
                    "name": name,
                    "bus_name": bus_name,
                    "status": status,
                    "pid": std::process::id(),
                    "uptime_secs": started_at.elapsed().as_secs(),
                    "wake_count": monitor.wake_count(),
                }))
            }
        });
    }

    {
        let daemon = Arc::clone(daemon);
        registry.register("health_check", move |_args| {
            let daemon = Arc::clone(&daemon);
            async move {
                let report = daemon.health_check().await;
                match serde_json::to_value(&report) {
                    Ok(body) => envelope_ok(body),
                    Err(err) => envelope_err(format!("health serialization failed: {err}")),
                }
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        registry.register("shutdown", move |_args| {
            let shutdown = shutdown.clone();
            async move {
                info!("shutdown requested via bus");
                shutdown.cancel();
                envelope_ok(json!({"stopping": true}))
            }
        });
    }

    {
        let daemon = Arc::clone(daemon);
        registry.register("get_state", move |_args| {
            let daemon = Arc::clone(&daemon);
            async move { envelope_ok(json!({"state": daemon.current_state().await})) }
        });
    }

    {
        let publisher = Arc::clone(publisher);
        registry.register("write_state", move |_args| {
            let publisher = Arc::clone(&publisher);
            async move {
                match publisher.publish_now().await {
                    Ok(()) => envelope_ok(json!({"path": publisher.path().display().to_string()})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });
    }

    {
        let monitor = Arc::clone(monitor);
        registry.register("notify_sleep", move |args| {
            let monitor = Arc::clone(&monitor);
            async move {
                let entering = args
                    .get("entering")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                monitor.external_signal(entering).await;
                envelope_ok(json!({"entering": entering}))
            }
        });
    }

    // Default reload handler; daemons override with a real one.
    registry.register("reload_config", move |_args| async move {
        envelope_ok(json!({"reloaded": false, "note": "daemon has no reloadable settings"}))
    });
}

/// Feed the service-manager watchdog at half its timeout, but only
/// while the daemon reports healthy.
fn spawn_watchdog(
    daemon: Arc<dyn Daemon>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(timeout) = watchdog_interval() else {
            return;
        };
        let interval = timeout / 2;
        info!(interval_secs = interval.as_secs(), "watchdog feeding enabled");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
            let report = daemon.health_check().await;
            if report.healthy {
                notify_watchdog();
            } else {
                warn!(message = %report.message, "skipping watchdog feed; daemon unhealthy");
            }
        }
    })
}

#[cfg(unix)]
fn watchdog_interval() -> Option<Duration> {
    let mut usec = 0u64;
    if sd_notify::watchdog_enabled(false, &mut usec) {
        Some(Duration::from_micros(usec))
    } else {
        None
    }
}

#[cfg(not(unix))]
fn watchdog_interval() -> Option<Duration> {
    None
}

#[cfg(unix)]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        warn!(%err, "service-manager READY notification failed");
    }
}

#[cfg(not(unix))]
fn notify_ready() {}

#[cfg(unix)]
fn notify_watchdog() {
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]);
}

#[cfg(not(unix))]
fn notify_watchdog() {}

#[cfg(unix)]
fn notify_stopping() {
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
}

#[cfg(not(unix))]
fn notify_stopping() {}

/// First SIGTERM/SIGINT requests graceful shutdown; the second one
/// terminates hard.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received; starting graceful shutdown");
        shutdown.cancel();

        wait_for_signal().await;
        error!("second shutdown signal received; forcing exit");
        std::process::exit(1);
    });
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
