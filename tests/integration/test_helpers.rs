//! Shared fakes and fixtures for the integration suites.

#![allow(dead_code)] // Each suite uses a subset of the helpers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use botfleet::bus::SignalHub;
use botfleet::config::SlackConfig;
use botfleet::meet::browser::{BrowserHandle, BrowserLauncher, CaptionEntry};
use botfleet::meet::calendar::{CalendarEvent, CalendarProvider, ProviderCalendar};
use botfleet::meet::devices::DeviceAllocation;
use botfleet::models::message::PendingMessage;
use botfleet::persistence::caches::CacheRepo;
use botfleet::persistence::db::{self, Database};
use botfleet::persistence::notified::NotifiedRepo;
use botfleet::persistence::pending::PendingRepo;
use botfleet::persistence::watermarks::WatermarkRepo;
use botfleet::slack::approval::ApprovalQueue;
use botfleet::slack::listener::{SharedSlackConfig, SlackListener};
use botfleet::slack::notifier::RecordingNotifier;
use botfleet::slack::provider::{
    GeneratedResponse, MessagingProvider, Page, ProviderChannel, ProviderGroup, ProviderMessage,
    ProviderUser, ResponseGenerator,
};
use botfleet::{AppError, Result};

// ── Messaging provider fake ─────────────────────────────

/// Scripted provider: per-channel message batches, recorded sends, and
/// an optional rate-limit schedule keyed by call count.
#[derive(Default)]
pub struct ScriptedProvider {
    pub messages: Mutex<HashMap<String, Vec<ProviderMessage>>>,
    pub users: Mutex<HashMap<String, ProviderUser>>,
    pub channels: Mutex<Vec<ProviderChannel>>,
    pub members: Mutex<HashMap<String, Vec<String>>>,
    pub sent: Mutex<Vec<(String, String, Option<String>)>>,
    pub fail_sends: AtomicBool,
    /// `get_user` call counter, for rate-limit scheduling.
    pub user_calls: AtomicU32,
    /// When set, the nth (1-based) `get_user` call is rate limited.
    pub rate_limit_user_call: Option<(u32, u64)>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn push_message(&self, channel_id: &str, ts: &str, user_id: &str, text: &str) {
        self.messages
            .lock()
            .await
            .entry(channel_id.to_owned())
            .or_default()
            .push(ProviderMessage {
                ts: ts.to_owned(),
                user_id: user_id.to_owned(),
                text: text.to_owned(),
                thread_ts: None,
                is_bot: false,
                raw: json!({"ts": ts}),
            });
    }

    pub async fn add_user(&self, id: &str, name: &str, email: &str) {
        self.users.lock().await.insert(
            id.to_owned(),
            ProviderUser {
                id: id.to_owned(),
                name: name.to_owned(),
                display_name: name.to_owned(),
                real_name: name.to_owned(),
                email: email.to_owned(),
                avatar_url: String::new(),
                is_bot: false,
                deleted: false,
            },
        );
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl MessagingProvider for ScriptedProvider {
    async fn list_channels(
        &self,
        _cursor: Option<String>,
        _limit: u32,
    ) -> Result<Page<ProviderChannel>> {
        Ok(Page {
            items: self.channels.lock().await.clone(),
            next_cursor: None,
        })
    }

    async fn channel_info(&self, channel_id: &str) -> Result<Option<ProviderChannel>> {
        Ok(self
            .channels
            .lock()
            .await
            .iter()
            .find(|c| c.id == channel_id)
            .cloned())
    }

    async fn channel_history(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ProviderMessage>> {
        let messages = self.messages.lock().await;
        let batch = messages.get(channel_id).cloned().unwrap_or_default();
        let filtered: Vec<ProviderMessage> = batch
            .into_iter()
            .filter(|m| oldest.is_none_or(|o| m.ts.as_str() > o))
            .take(limit as usize)
            .collect();
        Ok(filtered)
    }

    async fn channel_members(&self, channel_id: &str, count: u32) -> Result<Vec<String>> {
        let members = self.members.lock().await;
        let ids = members.get(channel_id).cloned().unwrap_or_default();
        Ok(ids.into_iter().take(count as usize).collect())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<ProviderUser>> {
        let call = self.user_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limited_call, retry_after)) = self.rate_limit_user_call {
            if call == limited_call {
                return Err(AppError::RateLimited(retry_after));
            }
        }
        Ok(self.users.lock().await.get(user_id).cloned())
    }

    async fn get_users(&self, _cursor: Option<String>, _limit: u32) -> Result<Page<ProviderUser>> {
        Ok(Page {
            items: self.users.lock().await.values().cloned().collect(),
            next_cursor: None,
        })
    }

    async fn thread_replies(
        &self,
        _channel_id: &str,
        _thread_ts: &str,
        _limit: u32,
    ) -> Result<Vec<ProviderMessage>> {
        Ok(Vec::new())
    }

    async fn user_groups(&self) -> Result<Vec<ProviderGroup>> {
        Ok(Vec::new())
    }

    async fn send_message(
        &self,
        channel_id: &str,
        text: &str,
        thread_parent: Option<&str>,
    ) -> Result<String> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(AppError::Provider("scripted send failure".into()));
        }
        let mut sent = self.sent.lock().await;
        sent.push((
            channel_id.to_owned(),
            text.to_owned(),
            thread_parent.map(str::to_owned),
        ));
        Ok(format!("{}.000100", sent.len()))
    }
}

/// Responder that echoes a deterministic proposal.
pub struct EchoResponder;

#[async_trait]
impl ResponseGenerator for EchoResponder {
    async fn generate(&self, message: &PendingMessage) -> Result<GeneratedResponse> {
        Ok(GeneratedResponse {
            text: format!("re: {}", message.text),
            intent: "echo".to_owned(),
        })
    }
}

// ── Listener fixture ────────────────────────────────────

pub struct ListenerFixture {
    pub db: Arc<Database>,
    pub provider: Arc<ScriptedProvider>,
    pub listener: Arc<SlackListener>,
    pub queue: Arc<ApprovalQueue>,
    pub hub: SignalHub,
    pub notifier: RecordingNotifier,
    pub config: SharedSlackConfig,
    pub watermarks: WatermarkRepo,
    pub pending: PendingRepo,
    pub caches: CacheRepo,
    pub notified: NotifiedRepo,
}

pub async fn listener_fixture(slack_config: SlackConfig) -> ListenerFixture {
    let database = Arc::new(db::connect_memory().await.expect("db connect"));
    let provider = ScriptedProvider::new();
    let hub = SignalHub::new();
    let notifier = RecordingNotifier::new();

    let caches = CacheRepo::new(Arc::clone(&database));
    let watermarks = WatermarkRepo::new(Arc::clone(&database));
    let pending = PendingRepo::new(Arc::clone(&database));
    let notified = NotifiedRepo::new(Arc::clone(&database));

    let config: SharedSlackConfig = Arc::new(std::sync::RwLock::new(slack_config.clone()));
    let queue = Arc::new(ApprovalQueue::new(
        slack_config.max_pending,
        slack_config.history_size,
        pending.clone(),
        provider.clone() as Arc<dyn MessagingProvider>,
        hub.clone(),
    ));

    let listener = Arc::new(SlackListener::new(
        Arc::clone(&config),
        provider.clone() as Arc<dyn MessagingProvider>,
        Arc::new(EchoResponder),
        Arc::new(notifier.clone()),
        watermarks.clone(),
        pending.clone(),
        notified.clone(),
        caches.clone(),
        Arc::clone(&queue),
        hub.clone(),
    ));

    ListenerFixture {
        db: database,
        provider,
        listener,
        queue,
        hub,
        notifier,
        config,
        watermarks,
        pending,
        caches,
        notified,
    }
}

// ── Calendar / browser fakes ────────────────────────────

#[derive(Default)]
pub struct ScriptedCalendar {
    pub events: Mutex<Vec<CalendarEvent>>,
}

impl ScriptedCalendar {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn add_event(
        &self,
        id: &str,
        title: &str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        url: &str,
    ) {
        self.events.lock().await.push(CalendarEvent {
            id: id.to_owned(),
            title: title.to_owned(),
            organizer: "organizer@example.com".to_owned(),
            start,
            end,
            conference_url: Some(url.to_owned()),
        });
    }
}

#[async_trait]
impl CalendarProvider for ScriptedCalendar {
    async fn list_calendars(&self) -> Result<Vec<ProviderCalendar>> {
        Ok(vec![ProviderCalendar {
            id: "cal-1".to_owned(),
            name: "Primary".to_owned(),
        }])
    }

    async fn list_events(
        &self,
        _calendar_id: &str,
        _time_min: DateTime<Utc>,
        _time_max: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>> {
        Ok(self.events.lock().await.clone())
    }
}

/// Browser that joins instantly and exposes a caption injection side.
pub struct FakeBrowser {
    pub closed: AtomicBool,
    pub muted: AtomicBool,
    pub participants: Mutex<Vec<String>>,
    captions_rx: Mutex<Option<mpsc::Receiver<CaptionEntry>>>,
    pub captions_tx: mpsc::Sender<CaptionEntry>,
}

impl FakeBrowser {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        Arc::new(Self {
            closed: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            participants: Mutex::new(vec!["Alice".to_owned()]),
            captions_rx: Mutex::new(Some(rx)),
            captions_tx: tx,
        })
    }
}

#[async_trait]
impl BrowserHandle for FakeBrowser {
    async fn leave(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn participants(&self) -> Result<Vec<String>> {
        Ok(self.participants.lock().await.clone())
    }

    async fn take_captions(&self) -> Option<mpsc::Receiver<CaptionEntry>> {
        self.captions_rx.lock().await.take()
    }

    async fn mute(&self) -> Result<()> {
        self.muted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unmute(&self) -> Result<()> {
        self.muted.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Wrapper so the launcher can hand out `Box<dyn BrowserHandle>` while
/// the test keeps its own `Arc<FakeBrowser>` for inspection.
struct SharedBrowser(Arc<FakeBrowser>);

#[async_trait]
impl BrowserHandle for SharedBrowser {
    async fn leave(&self) -> Result<()> {
        self.0.leave().await
    }
    async fn participants(&self) -> Result<Vec<String>> {
        self.0.participants().await
    }
    async fn take_captions(&self) -> Option<mpsc::Receiver<CaptionEntry>> {
        self.0.take_captions().await
    }
    async fn mute(&self) -> Result<()> {
        self.0.mute().await
    }
    async fn unmute(&self) -> Result<()> {
        self.0.unmute().await
    }
    async fn is_closed(&self) -> bool {
        self.0.is_closed().await
    }
}

/// Launcher that records joins and hands out [`FakeBrowser`] handles.
#[derive(Default)]
pub struct InstantLauncher {
    pub joins: Mutex<Vec<String>>,
    pub browsers: Mutex<Vec<Arc<FakeBrowser>>>,
}

impl InstantLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn join_count(&self) -> usize {
        self.joins.lock().await.len()
    }

    pub async fn last_browser(&self) -> Option<Arc<FakeBrowser>> {
        self.browsers.lock().await.last().cloned()
    }
}

#[async_trait]
impl BrowserLauncher for InstantLauncher {
    async fn join(
        &self,
        url: &str,
        _devices: &DeviceAllocation,
    ) -> Result<Box<dyn BrowserHandle>> {
        self.joins.lock().await.push(url.to_owned());
        let browser = FakeBrowser::new();
        self.browsers.lock().await.push(Arc::clone(&browser));
        Ok(Box::new(SharedBrowser(browser)))
    }
}

/// Wait until `predicate` holds or the deadline passes.
pub async fn wait_until<F, Fut>(deadline: std::time::Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    false
}
