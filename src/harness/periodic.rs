//! Sleep-resilient periodicity primitives.
//!
//! Plain `tokio::time::sleep` is anchored to the monotonic clock, which
//! stands still while the machine is suspended: a 60 s sleep taken just
//! before an 8-hour suspend fires 8 hours late. Both primitives here
//! anchor their schedule in wall-clock time and sleep in short chunks so
//! a missed schedule is noticed within seconds of wake.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::future::BoxFuture;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;

/// Longest uninterrupted sleep; bounds wake-detection latency.
const SLEEP_CHUNK: Duration = Duration::from_secs(5);
/// Backoff applied after a callback error before the loop continues.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

type Callback = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn wall_elapsed(since: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(since)
        .unwrap_or(Duration::ZERO)
}

/// A recurring task whose schedule survives system suspend.
///
/// After each run the next fire is set to `last_run + interval +
/// uniform(0, max_jitter)`. If the loop discovers that more than
/// 1.5 × interval elapsed (it slept through one or more cycles), the
/// missed cycles are counted and the callback fires immediately.
pub struct RobustPeriodicTask {
    name: String,
    callback: Callback,
    interval: Duration,
    max_jitter: Duration,
    last_run: Arc<Mutex<Option<SystemTime>>>,
    missed_cycles: Arc<AtomicU64>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RobustPeriodicTask {
    /// Start the task loop.
    ///
    /// `callback` errors are logged and absorbed; the loop continues
    /// after a short backoff.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        interval: Duration,
        run_immediately: bool,
        max_jitter: Duration,
        callback: F,
    ) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let callback: Callback = Arc::new(move || Box::pin(callback()));
        let task = Arc::new(Self {
            name,
            callback,
            interval,
            max_jitter,
            last_run: Arc::new(Mutex::new(None)),
            missed_cycles: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        });

        let loop_task = Arc::clone(&task);
        let handle = tokio::spawn(async move {
            loop_task.run_loop(run_immediately).await;
        });
        if let Ok(mut slot) = task.handle.try_lock() {
            *slot = Some(handle);
        }
        task
    }

    /// Cycles the schedule slept through (suspend, long callbacks).
    #[must_use]
    pub fn missed_cycles(&self) -> u64 {
        self.missed_cycles.load(Ordering::Relaxed)
    }

    /// Fire the callback now, outside the normal schedule.
    pub async fn trigger_now(&self) {
        if let Err(err) = (self.callback)().await {
            error!(task = %self.name, %err, "periodic callback failed");
        }
        *self.last_run.lock().await = Some(SystemTime::now());
    }

    /// Stop the loop and wait for it to wind down.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run_loop(self: Arc<Self>, run_immediately: bool) {
        if run_immediately {
            self.fire().await;
        }

        while !self.cancel.is_cancelled() {
            let wait = self.compute_wait().await;
            let Some(mut wait) = wait else {
                // Missed one or more cycles; fire immediately.
                self.fire().await;
                continue;
            };

            if self.max_jitter > Duration::ZERO {
                let jitter = rand::thread_rng().gen_range(0.0..self.max_jitter.as_secs_f64());
                wait += Duration::from_secs_f64(jitter);
            }

            let overdue = self.chunked_sleep(wait).await;
            if self.cancel.is_cancelled() {
                break;
            }
            if overdue {
                // The machine slept through the wait; loop back so the
                // missed-cycle accounting runs before the next fire.
                continue;
            }

            self.fire().await;
        }
        debug!(task = %self.name, "periodic task stopped");
    }

    /// `None` means the schedule was missed and the caller should fire
    /// immediately; `Some(wait)` is the remaining time until the next
    /// scheduled fire.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    async fn compute_wait(&self) -> Option<Duration> {
        let last = *self.last_run.lock().await;
        let Some(last) = last else {
            return Some(self.interval);
        };

        let elapsed = wall_elapsed(last);
        if elapsed > self.interval.mul_f64(1.5) {
            let missed = (elapsed.as_secs_f64() / self.interval.as_secs_f64()) as u64;
            let missed = missed.saturating_sub(1);
            if missed > 0 {
                self.missed_cycles.fetch_add(missed, Ordering::Relaxed);
                info!(
                    task = %self.name,
                    missed,
                    elapsed_secs = elapsed.as_secs(),
                    "missed cycles detected"
                );
            }
            return None;
        }
        Some(self.interval.saturating_sub(elapsed))
    }

    /// Sleep `wait` in chunks, returning `true` if a suspend gap was
    /// detected mid-wait.
    async fn chunked_sleep(&self, wait: Duration) -> bool {
        let mut remaining = wait;
        while remaining > Duration::ZERO && !self.cancel.is_cancelled() {
            let chunk = remaining.min(SLEEP_CHUNK);
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = tokio::time::sleep(chunk) => {}
            }
            remaining = remaining.saturating_sub(chunk);

            let last = *self.last_run.lock().await;
            if let Some(last) = last {
                if wall_elapsed(last) > self.interval.mul_f64(1.5) {
                    return true;
                }
            }
        }
        false
    }

    async fn fire(&self) {
        if let Err(err) = (self.callback)().await {
            error!(task = %self.name, %err, "periodic callback failed");
            tokio::time::sleep(ERROR_BACKOFF).await;
        }
        *self.last_run.lock().await = Some(SystemTime::now());
    }
}

/// A single-shot, rearmable timer anchored in wall-clock time.
///
/// Disarmed until [`reschedule`](Self::reschedule) is called. Once the
/// wall clock passes the armed deadline the callback fires exactly once
/// and the timer disarms again: including immediately after wake when
/// the deadline passed during suspend.
pub struct RobustTimer {
    name: String,
    callback: Callback,
    deadline: Arc<Mutex<Option<SystemTime>>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RobustTimer {
    /// Start the timer loop, initially disarmed.
    pub fn spawn<F, Fut>(name: impl Into<String>, callback: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let callback: Callback = Arc::new(move || Box::pin(callback()));
        let timer = Arc::new(Self {
            name: name.into(),
            callback,
            deadline: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        });

        let loop_timer = Arc::clone(&timer);
        let handle = tokio::spawn(async move {
            loop_timer.run_loop().await;
        });
        if let Ok(mut slot) = timer.handle.try_lock() {
            *slot = Some(handle);
        }
        timer
    }

    /// Arm (or re-arm) the timer to fire after `delay`.
    pub async fn reschedule(&self, delay: Duration) {
        *self.deadline.lock().await = Some(SystemTime::now() + delay);
    }

    /// Disarm without firing.
    pub async fn disarm(&self) {
        *self.deadline.lock().await = None;
    }

    /// Whether a deadline is currently armed.
    pub async fn is_armed(&self) -> bool {
        self.deadline.lock().await.is_some()
    }

    /// Stop the timer loop.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run_loop(self: Arc<Self>) {
        while !self.cancel.is_cancelled() {
            let due = {
                let deadline = self.deadline.lock().await;
                deadline.is_some_and(|at| SystemTime::now() >= at)
            };

            if due {
                *self.deadline.lock().await = None;
                if let Err(err) = (self.callback)().await {
                    error!(timer = %self.name, %err, "timer callback failed");
                }
                continue;
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(Duration::from_millis(250).min(SLEEP_CHUNK)) => {}
            }
        }
        debug!(timer = %self.name, "timer stopped");
    }
}
