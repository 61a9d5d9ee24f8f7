//! The meet daemon: wires the scheduler into the harness contract and
//! exposes the meeting-control bus surface.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bus::{envelope_err, envelope_ok, MethodRegistry, SignalHub};
use crate::config::GlobalConfig;
use crate::harness::periodic::RobustPeriodicTask;
use crate::harness::{Daemon, DaemonIdentity};
use crate::meet::browser::BrowserLauncher;
use crate::meet::calendar::CalendarProvider;
use crate::meet::devices::MediaAllocator;
use crate::meet::scheduler::MeetingScheduler;
use crate::meet::siblings::VideoClient;
use crate::models::stats::HealthReport;
use crate::persistence::db::{self, Database};
use crate::persistence::meetings::{MeetingHistoryRepo, TranscriptRepo};
use crate::Result;

/// The meet daemon.
pub struct MeetDaemon {
    identity: DaemonIdentity,
    scheduler: Arc<MeetingScheduler>,
    db: Arc<Database>,
    calendars: Vec<crate::config::CalendarEntry>,
    poll_interval: Duration,
    tick_interval: Duration,
    poll_task: Mutex<Option<Arc<RobustPeriodicTask>>>,
    tick_task: Mutex<Option<Arc<RobustPeriodicTask>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl MeetDaemon {
    /// Connect the store and wire the scheduler. Running resources
    /// start in [`Daemon::startup`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be opened.
    pub async fn build(
        config: &GlobalConfig,
        calendar: Arc<dyn CalendarProvider>,
        launcher: Arc<dyn BrowserLauncher>,
        allocator: Arc<dyn MediaAllocator>,
        video: Arc<VideoClient>,
        hub: SignalHub,
    ) -> Result<Arc<Self>> {
        let db_path = config.db_path("meet").to_string_lossy().to_string();
        let db = Arc::new(db::connect(&db_path).await?);

        let transcripts = TranscriptRepo::new(Arc::clone(&db));
        let history = MeetingHistoryRepo::new(Arc::clone(&db));

        let scheduler = MeetingScheduler::new(
            config.meet.clone(),
            calendar,
            launcher,
            allocator,
            video,
            transcripts,
            history,
            hub,
        );

        Ok(Arc::new(Self {
            identity: DaemonIdentity::new("meet"),
            scheduler,
            db,
            calendars: config.meet.calendars.clone(),
            poll_interval: Duration::from_secs(config.meet.poll_interval_secs),
            tick_interval: Duration::from_secs(config.meet.tick_interval_secs),
            poll_task: Mutex::new(None),
            tick_task: Mutex::new(None),
            event_loop: Mutex::new(None),
            started: AtomicBool::new(false),
        }))
    }

    /// The scheduler, exposed for tests.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<MeetingScheduler> {
        &self.scheduler
    }
}

#[async_trait]
impl Daemon for MeetDaemon {
    fn identity(&self) -> &DaemonIdentity {
        &self.identity
    }

    async fn startup(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.scheduler.reclaim_orphan_devices().await;

        *self.event_loop.lock().await = Some(self.scheduler.spawn_event_loop().await);

        let scheduler = Arc::clone(&self.scheduler);
        let poll_task = RobustPeriodicTask::spawn(
            "calendar_poll",
            self.poll_interval,
            true,
            Duration::from_secs(2),
            move || {
                let scheduler = Arc::clone(&scheduler);
                async move { scheduler.poll_calendars().await }
            },
        );
        *self.poll_task.lock().await = Some(poll_task);

        let scheduler = Arc::clone(&self.scheduler);
        let tick_task = RobustPeriodicTask::spawn(
            "meeting_tick",
            self.tick_interval,
            false,
            Duration::ZERO,
            move || {
                let scheduler = Arc::clone(&scheduler);
                async move { scheduler.tick().await }
            },
        );
        *self.tick_task.lock().await = Some(tick_task);

        info!("meet daemon started");
        Ok(())
    }

    async fn run_daemon(&self, shutdown: CancellationToken) -> Result<()> {
        shutdown.cancelled().await;
        Ok(())
    }

    async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.tick_task.lock().await.take() {
            task.stop().await;
        }
        if let Some(task) = self.poll_task.lock().await.take() {
            task.stop().await;
        }

        // Leave every live meeting before dropping the event loop.
        let meetings = self.scheduler.meetings().await;
        for meeting in meetings {
            if meeting.status == crate::models::meeting::MeetingStatus::Active {
                let _ = self
                    .scheduler
                    .leave_by_event(&meeting.event_id, "daemon shutdown")
                    .await;
            }
        }

        if let Some(handle) = self.event_loop.lock().await.take() {
            handle.abort();
        }
        info!("meet daemon stopped");
    }

    async fn on_system_wake(&self) {
        self.scheduler.on_wake().await;
    }

    async fn health_check(&self) -> HealthReport {
        let mut checks = BTreeMap::new();
        checks.insert("started".to_owned(), self.started.load(Ordering::SeqCst));

        let store_ok = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(self.db.as_ref())
            .await
            .is_ok();
        checks.insert("store_reachable".to_owned(), store_ok);

        let poll_alive = self.poll_task.lock().await.is_some()
            || !self.started.load(Ordering::SeqCst);
        checks.insert("poll_task_alive".to_owned(), poll_alive);

        HealthReport::from_checks(checks)
    }

    #[allow(clippy::too_many_lines)] // One registration block per bus method.
    fn register_methods(&self, registry: &mut MethodRegistry) {
        let scheduler = Arc::clone(&self.scheduler);
        registry.register("list_meetings", move |_args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let meetings = scheduler.meetings().await;
                envelope_ok(json!({"count": meetings.len(), "meetings": meetings}))
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        registry.register("approve_meeting", move |args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let Some(event_id) = args.get("event_id").and_then(Value::as_str) else {
                    return envelope_err("missing required 'event_id' field");
                };
                let mode = args.get("mode").and_then(Value::as_str).unwrap_or("notes");
                let by = args.get("approved_by").and_then(Value::as_str).unwrap_or("bus");
                match scheduler.approve(event_id, mode, by).await {
                    Ok(()) => envelope_ok(json!({"event_id": event_id, "status": "approved"})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        registry.register("unapprove_meeting", move |args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let Some(event_id) = args.get("event_id").and_then(Value::as_str) else {
                    return envelope_err("missing required 'event_id' field");
                };
                match scheduler.unapprove(event_id).await {
                    Ok(()) => envelope_ok(json!({"event_id": event_id, "status": "scheduled"})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        registry.register("skip_meeting", move |args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let Some(event_id) = args.get("event_id").and_then(Value::as_str) else {
                    return envelope_err("missing required 'event_id' field");
                };
                match scheduler.skip(event_id).await {
                    Ok(()) => envelope_ok(json!({"event_id": event_id, "status": "skipped"})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        registry.register("set_meeting_mode", move |args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let Some(event_id) = args.get("event_id").and_then(Value::as_str) else {
                    return envelope_err("missing required 'event_id' field");
                };
                let Some(mode) = args.get("mode").and_then(Value::as_str) else {
                    return envelope_err("missing required 'mode' field");
                };
                match scheduler.set_mode(event_id, mode).await {
                    Ok(()) => envelope_ok(json!({"event_id": event_id, "mode": mode})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        registry.register("toggle_video", move |args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let Some(event_id) = args.get("event_id").and_then(Value::as_str) else {
                    return envelope_err("missing required 'event_id' field");
                };
                let enabled = args.get("enabled").and_then(Value::as_bool).unwrap_or(true);
                match scheduler.set_video_enabled(event_id, enabled).await {
                    Ok(()) => envelope_ok(json!({"event_id": event_id, "video_enabled": enabled})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        registry.register("force_join", move |args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let Some(event_id) = args.get("event_id").and_then(Value::as_str) else {
                    return envelope_err("missing required 'event_id' field");
                };
                match scheduler.force_join(event_id).await {
                    Ok(()) => envelope_ok(json!({"event_id": event_id, "status": "joining"})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        registry.register("join_meeting", move |args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let Some(url) = args.get("url").and_then(Value::as_str) else {
                    return envelope_err("missing required 'url' field");
                };
                let title = args.get("title").and_then(Value::as_str).unwrap_or_default();
                let mode = args.get("mode").and_then(Value::as_str).unwrap_or_default();
                let video = args
                    .get("video_enabled")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                match scheduler.join_adhoc(url, title, mode, video).await {
                    Ok(event_id) => {
                        envelope_ok(json!({"event_id": event_id, "status": "joining"}))
                    }
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        registry.register("leave_meeting", move |args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let session_id = args
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let result = if session_id.is_empty() {
                    // No ID: leave the single active session, if any.
                    match scheduler.participants().await.keys().next().cloned() {
                        Some(only) => scheduler.leave_by_session(&only).await,
                        None => Err(crate::AppError::NotFound("no active session".into())),
                    }
                } else {
                    scheduler.leave_by_session(session_id).await
                };
                match result {
                    Ok(event_id) => {
                        envelope_ok(json!({"event_id": event_id, "status": "completed"}))
                    }
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        registry.register("get_captions", move |args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map_or(50, |v| usize::try_from(v).unwrap_or(50));
                let captions = scheduler.captions(limit).await;
                envelope_ok(json!({"count": captions.len(), "captions": captions}))
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        registry.register("get_participants", move |_args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let rosters = scheduler.participants().await;
                envelope_ok(json!({"participants": rosters}))
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        registry.register("mute_audio", move |args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let session_id = args
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match scheduler.mute(session_id).await {
                    Ok(()) => envelope_ok(json!({"muted": true})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        registry.register("unmute_audio", move |args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let session_id = args
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match scheduler.unmute(session_id).await {
                    Ok(()) => envelope_ok(json!({"muted": false})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        registry.register("get_audio_state", move |args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let session_id = args
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match scheduler.audio_state(session_id).await {
                    Ok(muted) => envelope_ok(json!({"muted": muted})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let calendars = self.calendars.clone();
        registry.register("list_calendars", move |_args| {
            let calendars = calendars.clone();
            async move { envelope_ok(json!({"count": calendars.len(), "calendars": calendars})) }
        });

        let scheduler = Arc::clone(&self.scheduler);
        registry.register("get_meeting_history", move |args| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                let limit = args.get("limit").and_then(Value::as_i64).unwrap_or(20);
                match scheduler.meeting_history(limit).await {
                    Ok(rows) => envelope_ok(json!({"count": rows.len(), "history": rows})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });
    }

    async fn current_state(&self) -> Value {
        let status = self.scheduler.status().await;
        let state_label = if self.started.load(Ordering::SeqCst) {
            "running"
        } else {
            "stopped"
        };
        json!({
            "updated_at": Utc::now().to_rfc3339(),
            "status": state_label,
            "scheduler": status,
        })
    }

    fn stats(&self) -> Value {
        json!({
            "daemon": self.identity.name,
            "started": self.started.load(Ordering::SeqCst),
            "pid": std::process::id(),
        })
    }
}
