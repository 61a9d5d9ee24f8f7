//! The listener: periodic pull of watched conversations.
//!
//! Each tick walks every watched channel, fetches messages past the
//! stored watermark, and routes each one through classification and the
//! permission gate: auto-reply, queue for approval, or skip. The
//! watermark advances only after a message is fully handled, so a
//! failed message is retried on the next tick; per-channel order is
//! strictly monotonic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bus::SignalHub;
use crate::config::SlackConfig;
use crate::models::cache::CachedUser;
use crate::models::message::{ApprovalRecord, MessageStatus, PendingMessage};
use crate::models::stats::ListenerStats;
use crate::persistence::caches::CacheRepo;
use crate::persistence::notified::NotifiedRepo;
use crate::persistence::pending::PendingRepo;
use crate::persistence::watermarks::WatermarkRepo;
use crate::slack::approval::ApprovalQueue;
use crate::slack::classifier::{decide, ChannelPermissions, Classification, Decision, UserClassifier};
use crate::slack::notifier::DesktopNotifier;
use crate::slack::provider::{MessagingProvider, ProviderMessage, ResponseGenerator};
use crate::{AppError, Result};

/// Shared, hot-reloadable view of the listener's config section.
pub type SharedSlackConfig = Arc<std::sync::RwLock<SlackConfig>>;

/// The listener component. One per slack daemon.
pub struct SlackListener {
    config: SharedSlackConfig,
    provider: Arc<dyn MessagingProvider>,
    responder: Arc<dyn ResponseGenerator>,
    notifier: Arc<dyn DesktopNotifier>,
    watermarks: WatermarkRepo,
    pending: PendingRepo,
    notified: NotifiedRepo,
    caches: CacheRepo,
    queue: Arc<ApprovalQueue>,
    hub: SignalHub,
    stats: Mutex<ListenerStats>,
    /// Per-channel rate-limit deferrals: do not poll before this time.
    backoff_until: Mutex<HashMap<String, SystemTime>>,
}

impl SlackListener {
    /// Wire up the listener.
    #[allow(clippy::too_many_arguments)] // Constructor-only wiring.
    #[must_use]
    pub fn new(
        config: SharedSlackConfig,
        provider: Arc<dyn MessagingProvider>,
        responder: Arc<dyn ResponseGenerator>,
        notifier: Arc<dyn DesktopNotifier>,
        watermarks: WatermarkRepo,
        pending: PendingRepo,
        notified: NotifiedRepo,
        caches: CacheRepo,
        queue: Arc<ApprovalQueue>,
        hub: SignalHub,
    ) -> Self {
        Self {
            config,
            provider,
            responder,
            notifier,
            watermarks,
            pending,
            notified,
            caches,
            queue,
            hub,
            stats: Mutex::new(ListenerStats::default()),
            backoff_until: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the poll counters.
    pub async fn stats(&self) -> ListenerStats {
        self.stats.lock().await.clone()
    }

    /// One poll tick over every watched channel.
    ///
    /// Individual channel failures degrade stats but never abort the
    /// tick; the tick itself only errors on wholesale config problems.
    ///
    /// # Errors
    ///
    /// Currently never; the signature leaves room for fatal config
    /// errors surfacing here.
    pub async fn tick(&self) -> Result<()> {
        let (channels, max_per_tick) = {
            let config = self.config.read().map_err(|_| {
                AppError::Config("listener config lock poisoned".into())
            })?;
            (config.watched_channels.clone(), config.max_messages_per_tick)
        };

        let mut tick_errors: Vec<String> = Vec::new();
        let mut seen = 0_u64;

        for channel_id in &channels {
            if self.in_backoff(channel_id).await {
                debug!(channel_id, "channel in rate-limit backoff; skipped");
                continue;
            }
            match self.poll_channel(channel_id, max_per_tick).await {
                Ok(count) => seen += count,
                Err(AppError::RateLimited(secs)) => {
                    info!(channel_id, retry_after_secs = secs, "channel rate limited");
                    self.set_backoff(channel_id, Duration::from_secs(secs)).await;
                }
                Err(err) => {
                    warn!(channel_id, %err, "channel poll failed");
                    tick_errors.push(format!("{channel_id}: {err}"));
                }
            }
        }

        let mut stats = self.stats.lock().await;
        stats.polls += 1;
        stats.messages_seen += seen;
        stats.last_poll_at = Some(Utc::now());
        if tick_errors.is_empty() {
            stats.consecutive_errors = 0;
            stats.last_error = None;
        } else {
            stats.errors += tick_errors.len() as u64;
            stats.consecutive_errors += 1;
            stats.last_error = tick_errors.pop();
        }
        Ok(())
    }

    /// Rebuild the in-memory approval queue from pending rows that
    /// survived a restart. Responses are regenerated; no notifications
    /// are re-sent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be read.
    pub async fn requeue_persisted_pending(&self) -> Result<usize> {
        let rows = self
            .pending
            .list_by_status(MessageStatus::Pending, 1000)
            .await?;
        let count = rows.len();
        for message in rows {
            let response = match self.responder.generate(&message).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(id = %message.id, %err, "response regeneration failed on requeue");
                    continue;
                }
            };
            self.queue
                .enqueue(ApprovalRecord {
                    message,
                    response: response.text,
                    intent: response.intent,
                    classification: "restored".to_owned(),
                })
                .await;
        }
        if count > 0 {
            info!(count, "pending approvals restored from store");
        }
        Ok(count)
    }

    /// Send a message directly (bus `send_message` surface).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Provider` when the outbound call fails.
    pub async fn send_direct(
        &self,
        channel_id: &str,
        text: &str,
        thread_parent: Option<&str>,
    ) -> Result<String> {
        self.provider.send_message(channel_id, text, thread_parent).await
    }

    /// Whether the listener's error streak exceeds the health threshold.
    pub async fn degraded(&self) -> bool {
        let threshold = self
            .config
            .read()
            .map(|c| c.max_consecutive_errors)
            .unwrap_or(10);
        self.stats.lock().await.consecutive_errors >= threshold
    }

    async fn in_backoff(&self, channel_id: &str) -> bool {
        let backoff = self.backoff_until.lock().await;
        backoff
            .get(channel_id)
            .is_some_and(|until| SystemTime::now() < *until)
    }

    async fn set_backoff(&self, channel_id: &str, wait: Duration) {
        self.backoff_until
            .lock()
            .await
            .insert(channel_id.to_owned(), SystemTime::now() + wait);
    }

    /// Poll one channel; returns the number of messages handled.
    async fn poll_channel(&self, channel_id: &str, limit: u32) -> Result<u64> {
        let watermark = self.watermarks.get(channel_id).await?;
        let messages = self
            .provider
            .channel_history(channel_id, watermark.as_deref(), limit)
            .await?;

        if messages.is_empty() {
            return Ok(0);
        }

        let channel_name = self
            .caches
            .get_channel(channel_id)
            .await?
            .map_or_else(String::new, |c| c.name);

        let mut handled = 0_u64;
        for message in messages {
            match self.process_message(channel_id, &channel_name, &message).await {
                Ok(()) => {
                    self.watermarks
                        .advance(channel_id, &channel_name, &message.ts)
                        .await?;
                    handled += 1;
                }
                Err(AppError::RateLimited(secs)) => {
                    // No watermark advance; the message is retried after
                    // the backoff window.
                    if handled > 0 {
                        let mut stats = self.stats.lock().await;
                        stats.messages_seen += handled;
                    }
                    return Err(AppError::RateLimited(secs));
                }
                Err(err) => {
                    // Advance past a poisoned message only when its
                    // notification record proves it was durably seen;
                    // otherwise hold the watermark and retry next tick.
                    let durably_seen = self
                        .notified
                        .was_notified(channel_id, &message.ts)
                        .await
                        .unwrap_or(false);
                    if durably_seen {
                        warn!(channel_id, ts = %message.ts, %err, "skipping poisoned message");
                        self.watermarks
                            .advance(channel_id, &channel_name, &message.ts)
                            .await?;
                        handled += 1;
                    } else {
                        warn!(channel_id, ts = %message.ts, %err, "message failed; will retry");
                        return Err(err);
                    }
                }
            }
        }
        Ok(handled)
    }

    /// Steps a–h of the per-message pipeline.
    async fn process_message(
        &self,
        channel_id: &str,
        channel_name: &str,
        message: &ProviderMessage,
    ) -> Result<()> {
        let (self_user_id, keywords, classifier, permissions) = {
            let config = self
                .config
                .read()
                .map_err(|_| AppError::Config("listener config lock poisoned".into()))?;
            (
                config.self_user_id.clone(),
                config.keywords.clone(),
                UserClassifier::new(config.classifier.clone()),
                ChannelPermissions::new(config.channels.clone()),
            )
        };

        // a. Skip bot-authored and already-seen messages.
        if message.is_bot || message.user_id.is_empty() || message.user_id == self_user_id {
            return Ok(());
        }
        let id = PendingMessage::make_id(channel_id, &message.ts);
        if self.pending.exists(&id).await? {
            return Ok(());
        }

        // b. Resolve the author, refreshing the cache on miss.
        let user = self.resolve_user(&message.user_id).await?;

        // c. Keyword / mention / DM detection.
        let lower = message.text.to_lowercase();
        let matched_keywords: Vec<String> = keywords
            .iter()
            .filter(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
            .cloned()
            .collect();
        let is_mention =
            !self_user_id.is_empty() && message.text.contains(&format!("<@{self_user_id}>"));
        let is_dm = channel_id.starts_with('D');

        let record = PendingMessage {
            id: id.clone(),
            channel_id: channel_id.to_owned(),
            channel_name: channel_name.to_owned(),
            user_id: user.user_id.clone(),
            user_name: user.user_name.clone(),
            text: message.text.clone(),
            thread_parent: message.thread_ts.clone(),
            is_mention,
            is_dm,
            matched_keywords,
            timestamp: message.ts.clone(),
            created_at: Utc::now(),
            raw_payload: message.raw.to_string(),
            status: MessageStatus::Pending,
            processed_at: None,
        };

        // d–e. Classify, then consult the channel gate.
        let classification = classifier.classify(&user);
        let decision = decide(classification, permissions.mode_for(channel_id));

        match decision {
            Decision::Ignore => Ok(()),
            Decision::AutoReply => self.auto_reply(record).await,
            Decision::Queue => self.queue_for_approval(record, classification).await,
        }
    }

    /// f. Generate, send, and record an automatic response.
    async fn auto_reply(&self, mut record: PendingMessage) -> Result<()> {
        let response = self.responder.generate(&record).await?;
        self.provider
            .send_message(
                &record.channel_id,
                &response.text,
                record.thread_parent.as_deref(),
            )
            .await?;

        record.status = MessageStatus::Sent;
        record.processed_at = Some(Utc::now());
        self.pending.insert(&record).await?;
        info!(id = %record.id, "auto-response sent");
        Ok(())
    }

    /// g. Queue for approval, with de-duplicated desktop notification.
    async fn queue_for_approval(
        &self,
        record: PendingMessage,
        classification: Classification,
    ) -> Result<()> {
        self.pending.insert(&record).await?;

        let response = self.responder.generate(&record).await?;
        let approval = ApprovalRecord {
            message: record.clone(),
            response: response.text,
            intent: response.intent,
            classification: classification.as_str().to_owned(),
        };
        self.queue.enqueue(approval).await;
        self.hub.emit(
            "MessageReceived",
            serde_json::to_value(&record).unwrap_or(serde_json::Value::Null),
        );

        let already = self
            .notified
            .was_notified(&record.channel_id, &record.timestamp)
            .await?;
        if !already {
            self.notified
                .mark_notified(&record.channel_id, &record.timestamp)
                .await?;
            let title = if record.channel_name.is_empty() {
                format!("Message from {}", record.user_name)
            } else {
                format!("#{}: {}", record.channel_name, record.user_name)
            };
            self.notifier.notify(&title, &record.text).await;
        }
        Ok(())
    }

    async fn resolve_user(&self, user_id: &str) -> Result<CachedUser> {
        if let Some(user) = self.caches.get_user(user_id).await? {
            return Ok(user);
        }

        if let Some(fresh) = self.provider.get_user(user_id).await? {
            let cached = CachedUser {
                user_id: fresh.id,
                user_name: fresh.name,
                display_name: fresh.display_name,
                real_name: fresh.real_name,
                email: fresh.email,
                avatar_url: fresh.avatar_url,
                updated_at: Utc::now(),
            };
            self.caches.cache_users(std::slice::from_ref(&cached)).await?;
            return Ok(cached);
        }

        // Unknown author: classify conservatively with an empty record.
        Ok(CachedUser {
            user_id: user_id.to_owned(),
            user_name: String::new(),
            display_name: String::new(),
            real_name: String::new(),
            email: String::new(),
            avatar_url: String::new(),
            updated_at: Utc::now(),
        })
    }
}
