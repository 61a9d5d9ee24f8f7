//! The slack daemon: wires listener, approval queue, and background
//! sync into the harness contract and exposes the domain bus surface.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{envelope_err, envelope_ok, MethodRegistry, SignalHub};
use crate::config::GlobalConfig;
use crate::config_watcher::ConfigWatcher;
use crate::harness::periodic::RobustPeriodicTask;
use crate::harness::{Daemon, DaemonIdentity};
use crate::models::message::MessageStatus;
use crate::models::stats::HealthReport;
use crate::persistence::caches::{CacheRepo, FUZZY_THRESHOLD};
use crate::persistence::db::{self, Database};
use crate::persistence::pending::PendingRepo;
use crate::persistence::notified::NotifiedRepo;
use crate::persistence::resolve::resolve_target;
use crate::persistence::retention;
use crate::persistence::watermarks::WatermarkRepo;
use crate::slack::approval::ApprovalQueue;
use crate::slack::listener::{SharedSlackConfig, SlackListener};
use crate::slack::notifier::DesktopNotifier;
use crate::slack::provider::{MessagingProvider, ResponseGenerator};
use crate::slack::sync::{BackgroundSync, SyncKind};
use crate::Result;

/// The slack daemon.
pub struct SlackDaemon {
    identity: DaemonIdentity,
    config_path: PathBuf,
    slack_config: SharedSlackConfig,
    db: Arc<Database>,
    caches: CacheRepo,
    listener: Arc<SlackListener>,
    queue: Arc<ApprovalQueue>,
    sync: Arc<BackgroundSync>,
    poll_interval: Duration,
    poll_task: Mutex<Option<Arc<RobustPeriodicTask>>>,
    retention_task: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
    watcher: std::sync::Mutex<Option<ConfigWatcher>>,
    started: AtomicBool,
}

impl SlackDaemon {
    /// Connect the store and wire every component. Resources that run
    /// (tasks, watchers) start in [`Daemon::startup`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be opened.
    pub async fn build(
        config: &GlobalConfig,
        config_path: PathBuf,
        provider: Arc<dyn MessagingProvider>,
        responder: Arc<dyn ResponseGenerator>,
        notifier: Arc<dyn DesktopNotifier>,
        hub: SignalHub,
    ) -> Result<Arc<Self>> {
        let db_path = config.db_path("slack").to_string_lossy().to_string();
        let db = Arc::new(db::connect(&db_path).await?);

        let caches = CacheRepo::new(Arc::clone(&db));
        let watermarks = WatermarkRepo::new(Arc::clone(&db));
        let pending = PendingRepo::new(Arc::clone(&db));
        let notified = NotifiedRepo::new(Arc::clone(&db));

        let slack_config: SharedSlackConfig =
            Arc::new(std::sync::RwLock::new(config.slack.clone()));

        let queue = Arc::new(ApprovalQueue::new(
            config.slack.max_pending,
            config.slack.history_size,
            pending.clone(),
            Arc::clone(&provider),
            hub.clone(),
        ));

        let listener = Arc::new(SlackListener::new(
            Arc::clone(&slack_config),
            Arc::clone(&provider),
            responder,
            notifier,
            watermarks,
            pending,
            notified,
            caches.clone(),
            Arc::clone(&queue),
            hub.clone(),
        ));

        let sync = BackgroundSync::new(
            config.slack.sync.clone(),
            provider,
            caches.clone(),
            config.photo_dir(),
        );

        Ok(Arc::new(Self {
            identity: DaemonIdentity::new("slack"),
            config_path,
            slack_config,
            db,
            caches,
            listener,
            queue,
            sync,
            poll_interval: Duration::from_secs(config.slack.poll_interval_secs),
            poll_task: Mutex::new(None),
            retention_task: Mutex::new(None),
            watcher: std::sync::Mutex::new(None),
            started: AtomicBool::new(false),
        }))
    }

    /// The approval queue, exposed for tests and siblings in-process.
    #[must_use]
    pub fn queue(&self) -> &Arc<ApprovalQueue> {
        &self.queue
    }

    /// The listener, exposed for tests.
    #[must_use]
    pub fn listener(&self) -> &Arc<SlackListener> {
        &self.listener
    }
}

#[async_trait]
impl Daemon for SlackDaemon {
    fn identity(&self) -> &DaemonIdentity {
        &self.identity
    }

    async fn startup(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Approvals that survived a restart come back into the queue.
        if let Err(err) = self.listener.requeue_persisted_pending().await {
            warn!(%err, "pending requeue failed");
        }

        // Retention: purge old processed/notified rows, then hourly.
        let retention_cancel = CancellationToken::new();
        let retention_handle =
            retention::spawn_retention_task(Arc::clone(&self.db), retention_cancel.clone());
        *self.retention_task.lock().await = Some((retention_handle, retention_cancel));

        // Listener poll loop.
        let listener = Arc::clone(&self.listener);
        let poll_task = RobustPeriodicTask::spawn(
            "slack_listener",
            self.poll_interval,
            true,
            Duration::from_secs(1),
            move || {
                let listener = Arc::clone(&listener);
                async move { listener.tick().await }
            },
        );
        *self.poll_task.lock().await = Some(poll_task);

        // Config hot-reload for the listener's gate lists.
        let daemon_config = Arc::clone(&self.slack_config);
        match ConfigWatcher::new(&self.config_path, move |fresh| {
            if let Ok(mut section) = daemon_config.write() {
                *section = fresh.slack;
            }
        }) {
            Ok(watcher) => {
                if let Ok(mut slot) = self.watcher.lock() {
                    *slot = Some(watcher);
                }
            }
            Err(err) => warn!(%err, "config hot-reload unavailable"),
        }

        info!("slack daemon started");
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
        if let Some(task) = self.poll_task.lock().await.take() {
            task.stop().await;
        }
        self.sync.stop().await;
        if let Some((handle, cancel)) = self.retention_task.lock().await.take() {
            cancel.cancel();
            let _ = handle.await;
        }
        if let Ok(mut watcher) = self.watcher.lock() {
            watcher.take();
        }
        info!("slack daemon stopped");
    }

    async fn on_system_wake(&self) {
        info!("wake: triggering immediate listener poll");
        let task = self.poll_task.lock().await.clone();
        if let Some(task) = task {
            task.trigger_now().await;
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    async fn health_check(&self) -> HealthReport {
        let mut checks = BTreeMap::new();

        let stats = self.listener.stats().await;
        let loop_alive = stats.last_poll_at.is_some_and(|at| {
            Utc::now().signed_duration_since(at).num_seconds()
                < (self.poll_interval.as_secs() as i64) * 3 + 5
        }) || !self.started.load(Ordering::SeqCst);
        checks.insert("listener_alive".to_owned(), loop_alive);
        checks.insert(
            "errors_below_threshold".to_owned(),
            !self.listener.degraded().await,
        );

        let store_ok = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(self.db.as_ref())
            .await
            .is_ok();
        checks.insert("store_reachable".to_owned(), store_ok);

        HealthReport::from_checks(checks)
    }

    #[allow(clippy::too_many_lines)] // One registration block per bus method.
    fn register_methods(&self, registry: &mut MethodRegistry) {
        let queue = Arc::clone(&self.queue);
        registry.register("get_pending", move |_args| {
            let queue = Arc::clone(&queue);
            async move {
                let pending = queue.get_pending().await;
                envelope_ok(json!({
                    "count": pending.len(),
                    "pending": pending,
                }))
            }
        });

        let queue = Arc::clone(&self.queue);
        registry.register("approve_message", move |args| {
            let queue = Arc::clone(&queue);
            async move {
                let Some(id) = args.get("id").and_then(Value::as_str) else {
                    return envelope_err("missing required 'id' field");
                };
                match queue.approve(id).await {
                    Ok(record) => envelope_ok(json!({"record": record})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let queue = Arc::clone(&self.queue);
        registry.register("reject_message", move |args| {
            let queue = Arc::clone(&queue);
            async move {
                let Some(id) = args.get("id").and_then(Value::as_str) else {
                    return envelope_err("missing required 'id' field");
                };
                match queue.reject(id).await {
                    Ok(record) => envelope_ok(json!({"record": record})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let queue = Arc::clone(&self.queue);
        registry.register_bulk("approve_all", move |_args| {
            let queue = Arc::clone(&queue);
            async move {
                let outcomes = queue.approve_all().await;
                let sent = outcomes.iter().filter(|o| o.sent).count();
                envelope_ok(json!({
                    "attempted": outcomes.len(),
                    "sent": sent,
                    "outcomes": outcomes,
                }))
            }
        });

        let queue = Arc::clone(&self.queue);
        registry.register("get_history", move |args| {
            let queue = Arc::clone(&queue);
            async move {
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map_or(50, |v| v as usize);
                let channel = args.get("channel_id").and_then(Value::as_str).map(str::to_owned);
                let user = args.get("user_id").and_then(Value::as_str).map(str::to_owned);
                let status = args
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(MessageStatus::parse);
                let history = queue
                    .get_history(limit, channel.as_deref(), user.as_deref(), status)
                    .await;
                envelope_ok(json!({"count": history.len(), "history": history}))
            }
        });

        let caches = self.caches.clone();
        let listener = Arc::clone(&self.listener);
        registry.register("send_message", move |args| {
            let caches = caches.clone();
            let listener = Arc::clone(&listener);
            async move {
                let Some(target) = args.get("channel_id").and_then(Value::as_str) else {
                    return envelope_err("missing required 'channel_id' field");
                };
                let Some(text) = args.get("text").and_then(Value::as_str) else {
                    return envelope_err("missing required 'text' field");
                };
                let thread = args.get("thread_ts").and_then(Value::as_str);

                // Accept #names and @names as well as raw IDs.
                let resolved = match resolve_target(&caches, target).await {
                    Ok(hit) if hit.found => hit,
                    Ok(_) => return envelope_err(format!("unknown target: {target}")),
                    Err(err) => return envelope_err(err.to_string()),
                };
                let channel_id = resolved.id.unwrap_or_else(|| target.to_owned());

                match listener.send_direct(&channel_id, text, thread).await {
                    Ok(ts) => envelope_ok(json!({"channel_id": channel_id, "ts": ts})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let caches = self.caches.clone();
        registry.register("find_channel", move |args| {
            let caches = caches.clone();
            async move {
                let query = args.get("query").and_then(Value::as_str).unwrap_or_default();
                let limit = args.get("limit").and_then(Value::as_i64).unwrap_or(20);
                match caches.find_channels(query, limit).await {
                    Ok(channels) => {
                        envelope_ok(json!({"count": channels.len(), "channels": channels}))
                    }
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let caches = self.caches.clone();
        registry.register("find_user", move |args| {
            let caches = caches.clone();
            async move {
                let query = args.get("query").and_then(Value::as_str).unwrap_or_default();
                let limit = args.get("limit").and_then(Value::as_i64).unwrap_or(20);
                let direct = match caches.find_users(query, limit).await {
                    Ok(users) => users,
                    Err(err) => return envelope_err(err.to_string()),
                };
                if !direct.is_empty() {
                    return envelope_ok(json!({"count": direct.len(), "users": direct}));
                }
                match caches
                    .find_users_fuzzy(query, FUZZY_THRESHOLD, limit.unsigned_abs() as usize)
                    .await
                {
                    Ok(scored) => {
                        let users: Vec<Value> = scored
                            .into_iter()
                            .map(|(user, score)| {
                                json!({"user": user, "match_score": score})
                            })
                            .collect();
                        envelope_ok(json!({"count": users.len(), "users": users}))
                    }
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let caches = self.caches.clone();
        registry.register("get_my_channels", move |args| {
            let caches = caches.clone();
            async move {
                let limit = args.get("limit").and_then(Value::as_i64).unwrap_or(100);
                match caches.find_channels("", limit).await {
                    Ok(channels) => {
                        envelope_ok(json!({"count": channels.len(), "channels": channels}))
                    }
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let caches = self.caches.clone();
        registry.register("get_user_groups", move |_args| {
            let caches = caches.clone();
            async move {
                match caches.all_groups().await {
                    Ok(groups) => envelope_ok(json!({"count": groups.len(), "groups": groups})),
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let caches = self.caches.clone();
        registry.register("resolve_target", move |args| {
            let caches = caches.clone();
            async move {
                let Some(target) = args.get("target").and_then(Value::as_str) else {
                    return envelope_err("missing required 'target' field");
                };
                match resolve_target(&caches, target).await {
                    Ok(resolved) => match serde_json::to_value(&resolved) {
                        Ok(body) => envelope_ok(body),
                        Err(err) => envelope_err(err.to_string()),
                    },
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });

        let caches = self.caches.clone();
        registry.register("get_cache_stats", move |_args| {
            let caches = caches.clone();
            async move {
                let channels = caches.channel_count().await.unwrap_or(-1);
                let users = caches.user_count().await.unwrap_or(-1);
                let groups = caches.group_count().await.unwrap_or(-1);
                envelope_ok(json!({
                    "channels": channels,
                    "users": users,
                    "groups": groups,
                }))
            }
        });

        let sync = Arc::clone(&self.sync);
        registry.register("get_sync_status", move |_args| {
            let sync = Arc::clone(&sync);
            async move { envelope_ok(json!({"sync": sync.stats().await})) }
        });

        let sync = Arc::clone(&self.sync);
        registry.register("start_sync", move |_args| {
            let sync = Arc::clone(&sync);
            async move {
                sync.start().await;
                envelope_ok(json!({"running": true}))
            }
        });

        let sync = Arc::clone(&self.sync);
        registry.register("stop_sync", move |_args| {
            let sync = Arc::clone(&sync);
            async move {
                sync.stop().await;
                envelope_ok(json!({"running": false}))
            }
        });

        let sync = Arc::clone(&self.sync);
        registry.register("trigger_sync", move |args| {
            let sync = Arc::clone(&sync);
            async move {
                let kind = args
                    .get("kind")
                    .and_then(Value::as_str)
                    .unwrap_or("full");
                let Some(kind) = SyncKind::parse(kind) else {
                    return envelope_err(format!("unknown sync kind: {kind}"));
                };
                sync.trigger(kind).await;
                envelope_ok(json!({"triggered": format!("{kind:?}").to_lowercase()}))
            }
        });

        let config_path = self.config_path.clone();
        let slack_config = Arc::clone(&self.slack_config);
        registry.register("reload_config", move |_args| {
            let config_path = config_path.clone();
            let slack_config = Arc::clone(&slack_config);
            async move {
                match GlobalConfig::load_from_path(&config_path) {
                    Ok(fresh) => {
                        if let Ok(mut section) = slack_config.write() {
                            *section = fresh.slack;
                        }
                        envelope_ok(json!({"reloaded": true}))
                    }
                    Err(err) => envelope_err(err.to_string()),
                }
            }
        });
    }

    async fn current_state(&self) -> Value {
        let stats = self.listener.stats().await;
        let pending = self.queue.get_pending().await;
        let pending_summary: Vec<Value> = pending
            .iter()
            .map(|r| {
                json!({
                    "id": r.message.id,
                    "channel": r.message.channel_name,
                    "user": r.message.user_name,
                    "text": r.message.text,
                    "response": r.response,
                    "classification": r.classification,
                })
            })
            .collect();

        let status = if self.listener.degraded().await {
            "degraded"
        } else if self.started.load(Ordering::SeqCst) {
            "running"
        } else {
            "stopped"
        };

        let mut errors: Vec<String> = Vec::new();
        if let Some(err) = &stats.last_error {
            errors.push(err.clone());
        }
        errors.truncate(20);

        json!({
            "updated_at": Utc::now().to_rfc3339(),
            "status": status,
            "pending_count": pending.len(),
            "pending": pending_summary,
            "listener": stats,
            "sync": self.sync.stats().await,
            "cache_counts": {
                "channels": self.caches.channel_count().await.unwrap_or(-1),
                "users": self.caches.user_count().await.unwrap_or(-1),
                "groups": self.caches.group_count().await.unwrap_or(-1),
            },
            "errors": errors,
        })
    }

    fn stats(&self) -> Value {
        // Property reads must not block; report cheap process facts and
        // leave the counters to `get_state`.
        json!({
            "daemon": self.identity.name,
            "started": self.started.load(Ordering::SeqCst),
            "pid": std::process::id(),
        })
    }
}
