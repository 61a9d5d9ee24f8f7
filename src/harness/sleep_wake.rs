//! System sleep/wake detection.
//!
//! Two parallel detectors feed the same handler:
//!
//! 1. An externally delivered login-manager transition. Every daemon
//!    exposes `notify_sleep(entering)` on its bus; a system sleep hook
//!    (`botfleet-ctl sleep-signal`) fans the login manager's
//!    prepare-for-sleep transition out to the whole fleet.
//! 2. A wall-clock gap sampler. Every `check_interval` the monitor reads
//!    the wall clock; a gap beyond `gap_threshold` means the machine was
//!    suspended and a wake event fires.
//!
//! Wake events from both paths are coalesced so handlers observe each
//! physical wake once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

type Hook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Default sampling cadence for the gap detector.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Default gap beyond which the machine is considered to have slept.
pub const GAP_THRESHOLD: Duration = Duration::from_secs(30);
/// Window inside which wake reports from both detectors coalesce.
const WAKE_COALESCE: Duration = Duration::from_secs(10);

/// Sleep/wake monitor owned by the harness.
pub struct SleepWakeMonitor {
    on_wake: Hook,
    on_sleep: Hook,
    check_interval: Duration,
    gap_threshold: Duration,
    wake_count: AtomicU64,
    last_wake: Mutex<Option<Instant>>,
    last_sample: Mutex<SystemTime>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SleepWakeMonitor {
    /// Start the monitor with the default thresholds.
    pub fn spawn<W, WF, S, SF>(on_wake: W, on_sleep: S) -> Arc<Self>
    where
        W: Fn() -> WF + Send + Sync + 'static,
        WF: std::future::Future<Output = ()> + Send + 'static,
        S: Fn() -> SF + Send + Sync + 'static,
        SF: std::future::Future<Output = ()> + Send + 'static,
    {
        Self::spawn_with(on_wake, on_sleep, CHECK_INTERVAL, GAP_THRESHOLD)
    }

    /// Start the monitor with explicit thresholds (tests use short ones).
    pub fn spawn_with<W, WF, S, SF>(
        on_wake: W,
        on_sleep: S,
        check_interval: Duration,
        gap_threshold: Duration,
    ) -> Arc<Self>
    where
        W: Fn() -> WF + Send + Sync + 'static,
        WF: std::future::Future<Output = ()> + Send + 'static,
        S: Fn() -> SF + Send + Sync + 'static,
        SF: std::future::Future<Output = ()> + Send + 'static,
    {
        let monitor = Arc::new(Self {
            on_wake: Arc::new(move || Box::pin(on_wake())),
            on_sleep: Arc::new(move || Box::pin(on_sleep())),
            check_interval,
            gap_threshold,
            wake_count: AtomicU64::new(0),
            last_wake: Mutex::new(None),
            last_sample: Mutex::new(SystemTime::now()),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        });

        let loop_monitor = Arc::clone(&monitor);
        let handle = tokio::spawn(async move {
            loop_monitor.gap_loop().await;
        });
        if let Ok(mut slot) = monitor.handle.try_lock() {
            *slot = Some(handle);
        }
        monitor
    }

    /// Number of wake events observed since start.
    #[must_use]
    pub fn wake_count(&self) -> u64 {
        self.wake_count.load(Ordering::Relaxed)
    }

    /// Monotonic instant of the last wake event, if any.
    pub async fn last_wake(&self) -> Option<Instant> {
        *self.last_wake.lock().await
    }

    /// Deliver a login-manager sleep transition from the bus.
    ///
    /// `entering == true` runs the sleep hook; `false` runs the wake
    /// path (subject to coalescing with the gap detector).
    pub async fn external_signal(&self, entering: bool) {
        if entering {
            info!("system preparing for sleep");
            (self.on_sleep)().await;
        } else {
            info!("system wake reported by login manager");
            self.handle_wake().await;
        }
    }

    /// Stop the monitor.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn gap_loop(self: Arc<Self>) {
        while !self.cancel.is_cancelled() {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.check_interval) => {}
            }

            let now = SystemTime::now();
            let gap = {
                let mut last = self.last_sample.lock().await;
                let gap = now.duration_since(*last).unwrap_or(Duration::ZERO);
                *last = now;
                gap
            };

            if gap > self.gap_threshold {
                info!(gap_secs = gap.as_secs(), "wake detected from clock gap");
                self.handle_wake().await;
            }
        }
    }

    async fn handle_wake(&self) {
        {
            let mut last = self.last_wake.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < WAKE_COALESCE {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        self.wake_count.fetch_add(1, Ordering::Relaxed);
        // Reset the gap sampler so the wake is not double-reported.
        *self.last_sample.lock().await = SystemTime::now();

        let count = self.wake_count();
        info!(wake_count = count, "handling system wake");
        (self.on_wake)().await;
    }
}

impl Drop for SleepWakeMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
