//! The meeting scheduler: calendar projection, per-meeting state
//! machine, and multi-meeting concurrency.
//!
//! Meetings live in an arena keyed by event ID; sessions reference
//! their meeting by ID only, never by pointer. Two periodic drivers
//! feed the scheduler (the calendar poll and the state-machine tick),
//! plus an event channel for auto-leave timers and browser-closed
//! reports from session workers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::SignalHub;
use crate::config::MeetConfig;
use crate::meet::browser::BrowserLauncher;
use crate::meet::calendar::{parse_meet_url, CalendarProvider};
use crate::meet::devices::MediaAllocator;
use crate::meet::session::MeetingInstance;
use crate::meet::siblings::VideoClient;
use crate::models::meeting::{MeetingStatus, ScheduledMeeting, TranscriptEntry};
use crate::persistence::meetings::{MeetingHistoryRepo, MeetingHistoryRow, TranscriptRepo};
use crate::{AppError, Result};

/// Join retry backoff schedule (attempt 1 failure → 5 s, then 15 s).
const JOIN_BACKOFF: [Duration; 2] = [Duration::from_secs(5), Duration::from_secs(15)];
/// Backoff after the third (final) failed attempt is never taken, but
/// the attempt count is fixed at one more than the backoff table.
const JOIN_ATTEMPTS: usize = 3;
/// Rendered persona geometry handed to the video daemon.
const VIDEO_WIDTH: u32 = 1280;
const VIDEO_HEIGHT: u32 = 720;
/// Bound on the retained error strip.
const MAX_ERRORS: usize = 20;

/// Messages from session workers back to the scheduler.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// The auto-leave timer for a meeting fired.
    AutoLeave {
        /// Meeting whose grace window expired.
        event_id: String,
    },
    /// A session's browser window went away.
    BrowserClosed {
        /// Meeting whose page closed.
        event_id: String,
    },
}

struct SchedState {
    meetings: HashMap<String, ScheduledMeeting>,
    sessions: HashMap<String, Arc<MeetingInstance>>,
    joining: HashSet<String>,
    errors: VecDeque<String>,
}

/// The scheduler component. One per meet daemon.
pub struct MeetingScheduler {
    config: MeetConfig,
    calendar: Arc<dyn CalendarProvider>,
    launcher: Arc<dyn BrowserLauncher>,
    allocator: Arc<dyn MediaAllocator>,
    video: Arc<VideoClient>,
    transcripts: TranscriptRepo,
    history: MeetingHistoryRepo,
    hub: SignalHub,
    state: Mutex<SchedState>,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SchedulerEvent>>>,
    // For handing owned clones to spawned join/event tasks.
    self_weak: Weak<Self>,
}

impl MeetingScheduler {
    /// Wire up the scheduler.
    #[must_use]
    pub fn new(
        config: MeetConfig,
        calendar: Arc<dyn CalendarProvider>,
        launcher: Arc<dyn BrowserLauncher>,
        allocator: Arc<dyn MediaAllocator>,
        video: Arc<VideoClient>,
        transcripts: TranscriptRepo,
        history: MeetingHistoryRepo,
        hub: SignalHub,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|self_weak| Self {
            config,
            calendar,
            launcher,
            allocator,
            video,
            transcripts,
            history,
            hub,
            state: Mutex::new(SchedState {
                meetings: HashMap::new(),
                sessions: HashMap::new(),
                joining: HashSet::new(),
                errors: VecDeque::new(),
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            self_weak: self_weak.clone(),
        })
    }

    fn strong(&self) -> Option<Arc<Self>> {
        self.self_weak.upgrade()
    }

    /// Spawn the worker-event loop (auto-leave, browser-closed).
    pub async fn spawn_event_loop(&self) -> JoinHandle<()> {
        let rx = self.events_rx.lock().await.take();
        if rx.is_none() {
            warn!("scheduler event loop already running");
        }
        let scheduler = self.strong();
        tokio::spawn(async move {
            let (Some(scheduler), Some(mut receiver)) = (scheduler, rx) else {
                return;
            };
            while let Some(event) = receiver.recv().await {
                match event {
                    SchedulerEvent::AutoLeave { event_id } => {
                        if let Err(err) = scheduler.leave_by_event(&event_id, "auto-leave").await {
                            debug!(event_id, %err, "auto-leave skipped");
                        }
                    }
                    SchedulerEvent::BrowserClosed { event_id } => {
                        if let Err(err) =
                            scheduler.leave_by_event(&event_id, "browser closed").await
                        {
                            debug!(event_id, %err, "browser-closed cleanup skipped");
                        }
                    }
                }
            }
        })
    }

    /// Startup orphan pass: no sessions are alive yet, so any devices
    /// left allocated by a previous run are reclaimed.
    pub async fn reclaim_orphan_devices(&self) {
        let live: Vec<String> = self
            .state
            .lock()
            .await
            .sessions
            .values()
            .map(|s| s.session_id.clone())
            .collect();
        if let Err(err) = self.allocator.reclaim_orphans(&live).await {
            warn!(%err, "orphan device pass failed");
        }
    }

    // ── Calendar projection ─────────────────────────────

    /// Poll every enabled calendar and project upcoming meetings.
    ///
    /// Existing meetings are updated in place (title, times, organizer)
    /// unless their status is terminal.
    pub async fn poll_calendars(&self) -> Result<()> {
        let now = Utc::now();
        let horizon = now + chrono::Duration::hours(i64::try_from(self.config.look_ahead_hours).unwrap_or(24));

        for entry in self.config.calendars.iter().filter(|c| c.enabled) {
            let events = match self
                .calendar
                .list_events(&entry.calendar_id, now, horizon)
                .await
            {
                Ok(events) => events,
                Err(err) => {
                    warn!(calendar = %entry.calendar_id, %err, "calendar poll failed");
                    self.record_error(format!("calendar {}: {err}", entry.calendar_id))
                        .await;
                    continue;
                }
            };

            for event in events {
                let Some(raw_url) = event.conference_url.as_deref() else {
                    continue;
                };
                let Some(meet_url) = parse_meet_url(raw_url) else {
                    debug!(event_id = %event.id, "event url rejected at ingest");
                    continue;
                };
                if event.end.is_some_and(|end| event.start > end) {
                    debug!(event_id = %event.id, "event with inverted times rejected");
                    continue;
                }

                let mut state = self.state.lock().await;
                if let Some(existing) = state.meetings.get_mut(&event.id) {
                    if !existing.status.is_terminal() {
                        existing.title = event.title.clone();
                        existing.scheduled_start = event.start;
                        existing.scheduled_end = event.end;
                        existing.organizer = event.organizer.clone();
                        existing.meet_url = meet_url;
                    }
                    continue;
                }

                let status = if entry.auto_join {
                    MeetingStatus::Approved
                } else {
                    MeetingStatus::Scheduled
                };
                let meeting = ScheduledMeeting {
                    event_id: event.id.clone(),
                    title: event.title.clone(),
                    meet_url,
                    scheduled_start: event.start,
                    scheduled_end: event.end,
                    organizer: event.organizer.clone(),
                    calendar_id: entry.calendar_id.clone(),
                    calendar_name: entry.display_name.clone(),
                    status,
                    bot_mode: entry.bot_mode.clone(),
                    video_enabled: false,
                    approved_by: entry.auto_join.then(|| "auto".to_owned()),
                    error: None,
                    actual_end: None,
                };
                info!(event_id = %event.id, title = %event.title, ?status, "meeting projected");
                let payload = serde_json::to_value(&meeting).unwrap_or(Value::Null);
                state.meetings.insert(event.id.clone(), meeting);
                drop(state);
                self.hub.emit("MeetingScheduled", payload);
            }
        }
        Ok(())
    }

    // ── State machine tick ──────────────────────────────

    /// Evaluate every non-terminal meeting, in `(scheduled_start,
    /// event_id)` order.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        let pre_roll = chrono::Duration::seconds(i64::try_from(self.config.pre_roll_secs).unwrap_or(30));
        let grace = chrono::Duration::seconds(i64::try_from(self.config.grace_secs).unwrap_or(300));

        let mut due_joins: Vec<String> = Vec::new();
        let mut due_leaves: Vec<String> = Vec::new();
        {
            let state = self.state.lock().await;
            let mut ordered: Vec<&ScheduledMeeting> = state
                .meetings
                .values()
                .filter(|m| !m.status.is_terminal())
                .collect();
            ordered.sort_by(|a, b| {
                a.scheduled_start
                    .cmp(&b.scheduled_start)
                    .then_with(|| a.event_id.cmp(&b.event_id))
            });

            let mut in_flight = state.sessions.len() + state.joining.len();
            for meeting in ordered {
                match meeting.status {
                    MeetingStatus::Approved if now >= meeting.scheduled_start - pre_roll => {
                        if in_flight < self.config.max_parallel {
                            due_joins.push(meeting.event_id.clone());
                            in_flight += 1;
                        } else {
                            debug!(
                                event_id = %meeting.event_id,
                                cap = self.config.max_parallel,
                                "meeting held in approved; concurrency cap reached"
                            );
                        }
                    }
                    MeetingStatus::Active => {
                        if meeting
                            .scheduled_end
                            .is_some_and(|end| now >= end + grace)
                        {
                            due_leaves.push(meeting.event_id.clone());
                        }
                    }
                    _ => {}
                }
            }
        }

        for event_id in due_joins {
            self.begin_join(&event_id).await;
        }
        for event_id in due_leaves {
            if let Err(err) = self.leave_by_event(&event_id, "scheduled end + grace").await {
                debug!(event_id, %err, "tick leave skipped");
            }
        }
        Ok(())
    }

    // ── Join / leave ────────────────────────────────────

    /// Move a meeting into `joining` and spawn its join task. At most
    /// one join per meeting is in flight at a time.
    pub async fn begin_join(&self, event_id: &str) {
        {
            let mut state = self.state.lock().await;
            if state.joining.contains(event_id) || state.sessions.contains_key(event_id) {
                return;
            }
            let Some(meeting) = state.meetings.get_mut(event_id) else {
                return;
            };
            if !meeting.status.can_transition(MeetingStatus::Joining) {
                debug!(event_id, status = meeting.status.as_str(), "join not allowed");
                return;
            }
            meeting.status = MeetingStatus::Joining;
            state.joining.insert(event_id.to_owned());
        }
        self.hub
            .emit("StatusChanged", json!({"event_id": event_id, "status": "joining"}));

        let Some(scheduler) = self.strong() else { return };
        let event_id = event_id.to_owned();
        tokio::spawn(async move {
            scheduler.join_with_retries(&event_id).await;
        });
    }

    /// Up to three bounded attempts with exponential backoff; device
    /// allocation failures degrade to audio-only rather than aborting.
    async fn join_with_retries(&self, event_id: &str) {
        let (meet_url, video_enabled, leave_at) = {
            let state = self.state.lock().await;
            let Some(meeting) = state.meetings.get(event_id) else {
                return;
            };
            let grace = chrono::Duration::seconds(i64::try_from(self.config.grace_secs).unwrap_or(300));
            (
                meeting.meet_url.clone(),
                meeting.video_enabled,
                meeting.scheduled_end.map(|end| end + grace),
            )
        };

        let mut last_error = String::new();
        for attempt in 1..=JOIN_ATTEMPTS {
            // The meeting may have been skipped or shut down mid-retry.
            {
                let state = self.state.lock().await;
                if state.meetings.get(event_id).map(|m| m.status) != Some(MeetingStatus::Joining) {
                    drop(state);
                    self.clear_joining(event_id).await;
                    return;
                }
            }

            match self.try_join_once(event_id, &meet_url, video_enabled, leave_at).await {
                Ok(()) => return,
                Err(err) => {
                    last_error = err.to_string();
                    warn!(event_id, attempt, %err, "join attempt failed");
                    if attempt < JOIN_ATTEMPTS {
                        tokio::time::sleep(JOIN_BACKOFF[attempt - 1]).await;
                    }
                }
            }
        }

        // Attempts exhausted.
        {
            let mut state = self.state.lock().await;
            state.joining.remove(event_id);
            if let Some(meeting) = state.meetings.get_mut(event_id) {
                meeting.status = MeetingStatus::Error;
                meeting.error = Some(last_error.clone());
            }
        }
        self.record_error(format!("{event_id}: join failed: {last_error}"))
            .await;
        self.record_history(event_id, "error", None).await;
        self.hub
            .emit("StatusChanged", json!({"event_id": event_id, "status": "error", "error": last_error}));
    }

    async fn try_join_once(
        &self,
        event_id: &str,
        meet_url: &str,
        video_enabled: bool,
        leave_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let allocation = self.allocator.allocate(&session_id, video_enabled).await?;

        // Sibling renderer: refusal or absence is audio-only, not fatal.
        if video_enabled {
            let started = self
                .video
                .start_video(&allocation, VIDEO_WIDTH, VIDEO_HEIGHT, false)
                .await;
            if !started {
                self.record_error(format!("{event_id}: video renderer unavailable; audio-only"))
                    .await;
            }
        }

        let join_result = tokio::time::timeout(
            Duration::from_secs(self.config.join_attempt_timeout_secs),
            self.launcher.join(meet_url, &allocation),
        )
        .await;

        let browser = match join_result {
            Ok(Ok(handle)) => Arc::from(handle),
            Ok(Err(err)) => {
                let _ = self.allocator.release(&allocation).await;
                if video_enabled {
                    self.video.stop_video().await;
                }
                return Err(err);
            }
            Err(_) => {
                let _ = self.allocator.release(&allocation).await;
                if video_enabled {
                    self.video.stop_video().await;
                }
                return Err(AppError::Timeout("browser join attempt".into()));
            }
        };

        let instance = MeetingInstance::start(
            session_id,
            event_id.to_owned(),
            browser,
            allocation,
            self.transcripts.clone(),
            Arc::clone(&self.video),
            self.events_tx.clone(),
            leave_at,
            self.config.transcript_flush_entries,
            Duration::from_secs(self.config.transcript_flush_secs),
        )
        .await;

        {
            let mut state = self.state.lock().await;
            state.joining.remove(event_id);
            state.sessions.insert(event_id.to_owned(), instance);
            if let Some(meeting) = state.meetings.get_mut(event_id) {
                meeting.status = MeetingStatus::Active;
            }
        }
        info!(event_id, "meeting active");
        self.hub
            .emit("StatusChanged", json!({"event_id": event_id, "status": "active"}));
        Ok(())
    }

    async fn clear_joining(&self, event_id: &str) {
        self.state.lock().await.joining.remove(event_id);
    }

    /// Leave a meeting by event ID: stop the worker, release devices,
    /// mark completed, record history.
    pub async fn leave_by_event(&self, event_id: &str, reason: &str) -> Result<()> {
        let instance = {
            let mut state = self.state.lock().await;
            let already_done = state
                .meetings
                .get(event_id)
                .is_some_and(|m| m.status.is_terminal());
            if already_done {
                return Err(AppError::InvalidTransition(format!(
                    "meeting {event_id} already terminal"
                )));
            }
            state.sessions.remove(event_id)
        };

        let Some(instance) = instance else {
            return Err(AppError::NotFound(format!("no session for meeting {event_id}")));
        };

        info!(event_id, reason, "leaving meeting");
        let joined_at = instance.joined_at;
        let captions = instance.stop().await;
        self.video.stop_video().await;
        if let Err(err) = self.allocator.release(&instance.allocation).await {
            warn!(event_id, %err, "device release failed");
        }

        {
            let mut state = self.state.lock().await;
            if let Some(meeting) = state.meetings.get_mut(event_id) {
                meeting.status = MeetingStatus::Completed;
                meeting.actual_end = Some(Utc::now());
            }
        }
        self.record_history(event_id, "completed", Some(joined_at)).await;
        self.hub.emit(
            "StatusChanged",
            json!({"event_id": event_id, "status": "completed", "reason": reason, "captions": captions}),
        );
        Ok(())
    }

    /// Leave by session ID (bus `leave_meeting` surface).
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown session IDs.
    pub async fn leave_by_session(&self, session_id: &str) -> Result<String> {
        let event_id = {
            let state = self.state.lock().await;
            state
                .sessions
                .iter()
                .find(|(_, s)| s.session_id == session_id)
                .map(|(event_id, _)| event_id.clone())
        }
        .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
        self.leave_by_event(&event_id, "manual leave").await?;
        Ok(event_id)
    }

    // ── Wake handling ───────────────────────────────────

    /// Wake recovery: re-poll calendars immediately and clean up
    /// sessions whose browser died during suspend.
    pub async fn on_wake(&self) {
        if let Err(err) = self.poll_calendars().await {
            warn!(%err, "wake calendar poll failed");
        }

        let closed: Vec<String> = {
            let state = self.state.lock().await;
            let mut closed = Vec::new();
            for (event_id, session) in &state.sessions {
                if session.browser_closed().await {
                    closed.push(event_id.clone());
                }
            }
            closed
        };
        for event_id in closed {
            if let Err(err) = self
                .leave_by_event(&event_id, "browser closed during sleep")
                .await
            {
                debug!(event_id, %err, "wake cleanup skipped");
            }
        }

        if let Err(err) = self.tick().await {
            warn!(%err, "wake tick failed");
        }
    }

    // ── Manual controls ─────────────────────────────────

    /// Approve a scheduled meeting.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for unknown events,
    /// `AppError::InvalidTransition` outside `scheduled`.
    pub async fn approve(&self, event_id: &str, mode: &str, approved_by: &str) -> Result<()> {
        self.transition_meeting(event_id, MeetingStatus::Approved, |meeting| {
            if !mode.is_empty() {
                meeting.bot_mode = mode.to_owned();
            }
            meeting.approved_by = Some(approved_by.to_owned());
        })
        .await
    }

    /// Send an approved meeting back to `scheduled`.
    ///
    /// # Errors
    ///
    /// See [`approve`](Self::approve).
    pub async fn unapprove(&self, event_id: &str) -> Result<()> {
        self.transition_meeting(event_id, MeetingStatus::Scheduled, |meeting| {
            meeting.approved_by = None;
        })
        .await
    }

    /// Skip a meeting (terminal).
    ///
    /// # Errors
    ///
    /// See [`approve`](Self::approve).
    pub async fn skip(&self, event_id: &str) -> Result<()> {
        self.transition_meeting(event_id, MeetingStatus::Skipped, |_| {}).await
    }

    /// Change a non-terminal meeting's bot mode.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for unknown events,
    /// `AppError::InvalidTransition` for terminal meetings.
    pub async fn set_mode(&self, event_id: &str, mode: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let meeting = state
            .meetings
            .get_mut(event_id)
            .ok_or_else(|| AppError::NotFound(format!("meeting {event_id}")))?;
        if meeting.status.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "meeting {event_id} is {}",
                meeting.status.as_str()
            )));
        }
        meeting.bot_mode = mode.to_owned();
        Ok(())
    }

    /// Toggle whether the rendered persona video is requested.
    ///
    /// # Errors
    ///
    /// See [`set_mode`](Self::set_mode).
    pub async fn set_video_enabled(&self, event_id: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let meeting = state
            .meetings
            .get_mut(event_id)
            .ok_or_else(|| AppError::NotFound(format!("meeting {event_id}")))?;
        if meeting.status.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "meeting {event_id} is {}",
                meeting.status.as_str()
            )));
        }
        meeting.video_enabled = enabled;
        Ok(())
    }

    /// Join immediately, bypassing the pre-roll window.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for unknown events.
    pub async fn force_join(&self, event_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let meeting = state
                .meetings
                .get_mut(event_id)
                .ok_or_else(|| AppError::NotFound(format!("meeting {event_id}")))?;
            if meeting.status == MeetingStatus::Scheduled {
                meeting.status = MeetingStatus::Approved;
                meeting.approved_by = Some("force_join".to_owned());
            }
        }
        self.begin_join(event_id).await;
        Ok(())
    }

    /// Ad-hoc join of a URL not bound to any calendar. Returns the
    /// generated event ID immediately; callers poll `get_state` for
    /// progression. No auto-leave is armed (no known end).
    ///
    /// # Errors
    ///
    /// `AppError::Calendar` when the URL does not match the accepted
    /// provider pattern.
    pub async fn join_adhoc(
        &self,
        url: &str,
        title: &str,
        mode: &str,
        video_enabled: bool,
    ) -> Result<String> {
        let meet_url = parse_meet_url(url)
            .ok_or_else(|| AppError::Calendar(format!("not a conference url: {url}")))?;

        let event_id = format!("adhoc-{}", uuid::Uuid::new_v4());
        let meeting = ScheduledMeeting {
            event_id: event_id.clone(),
            title: if title.is_empty() { meet_url.clone() } else { title.to_owned() },
            meet_url,
            scheduled_start: Utc::now(),
            scheduled_end: None,
            organizer: String::new(),
            calendar_id: String::new(),
            calendar_name: String::new(),
            status: MeetingStatus::Approved,
            bot_mode: if mode.is_empty() { "notes".to_owned() } else { mode.to_owned() },
            video_enabled,
            approved_by: Some("adhoc".to_owned()),
            error: None,
            actual_end: None,
        };
        self.state
            .lock()
            .await
            .meetings
            .insert(event_id.clone(), meeting);
        self.begin_join(&event_id).await;
        Ok(event_id)
    }

    /// Request mute on a session (or the only active one).
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` when the session cannot be resolved.
    pub async fn mute(&self, session_id: &str) -> Result<()> {
        let instance = self.find_session(session_id).await?;
        instance.mute().await
    }

    /// Request unmute on a session (or the only active one).
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` when the session cannot be resolved.
    pub async fn unmute(&self, session_id: &str) -> Result<()> {
        let instance = self.find_session(session_id).await?;
        instance.unmute().await
    }

    /// Last requested mute state for a session.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` when the session cannot be resolved.
    pub async fn audio_state(&self, session_id: &str) -> Result<Option<bool>> {
        let instance = self.find_session(session_id).await?;
        Ok(instance.muted().await)
    }

    async fn find_session(&self, session_id: &str) -> Result<Arc<MeetingInstance>> {
        let state = self.state.lock().await;
        if session_id.is_empty() {
            // Convenience: a single active session needs no ID.
            if state.sessions.len() == 1 {
                if let Some(session) = state.sessions.values().next() {
                    return Ok(Arc::clone(session));
                }
            }
            return Err(AppError::NotFound(
                "session id required when multiple sessions are active".into(),
            ));
        }
        state
            .sessions
            .values()
            .find(|s| s.session_id == session_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))
    }

    // ── Observations ────────────────────────────────────

    /// Merged tail of live session transcript buffers, oldest first.
    pub async fn captions(&self, limit: usize) -> Vec<TranscriptEntry> {
        let sessions: Vec<Arc<MeetingInstance>> = {
            let state = self.state.lock().await;
            state.sessions.values().cloned().collect()
        };
        let mut merged = Vec::new();
        for session in sessions {
            merged.extend(session.recent_captions(limit).await);
        }
        merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let skip = merged.len().saturating_sub(limit);
        merged.into_iter().skip(skip).collect()
    }

    /// Participant rosters per active session.
    pub async fn participants(&self) -> HashMap<String, Vec<String>> {
        let sessions: Vec<Arc<MeetingInstance>> = {
            let state = self.state.lock().await;
            state.sessions.values().cloned().collect()
        };
        let mut rosters = HashMap::new();
        for session in sessions {
            rosters.insert(session.session_id.clone(), session.participants().await);
        }
        rosters
    }

    /// All known meetings, `(scheduled_start, event_id)` ordered.
    pub async fn meetings(&self) -> Vec<ScheduledMeeting> {
        let state = self.state.lock().await;
        let mut meetings: Vec<ScheduledMeeting> = state.meetings.values().cloned().collect();
        meetings.sort_by(|a, b| {
            a.scheduled_start
                .cmp(&b.scheduled_start)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        meetings
    }

    /// Recent finished meetings from the store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn meeting_history(&self, limit: i64) -> Result<Vec<MeetingHistoryRow>> {
        self.history.recent(limit).await
    }

    /// Derived status document for state files and `get_state`.
    pub async fn status(&self) -> Value {
        let meetings = self.meetings().await;
        let state = self.state.lock().await;

        let mut by_status: HashMap<&str, usize> = HashMap::new();
        for meeting in &meetings {
            *by_status.entry(meeting.status.as_str()).or_default() += 1;
        }

        let sessions: Vec<Value> = state
            .sessions
            .values()
            .map(|s| {
                json!({
                    "session_id": s.session_id,
                    "event_id": s.event_id,
                    "joined_at": s.joined_at.to_rfc3339(),
                    "scheduled_leave_at": s.scheduled_leave_at.map(|t| t.to_rfc3339()),
                    "captions_captured": s.caption_count(),
                })
            })
            .collect();

        json!({
            "meetings": meetings,
            "counts": by_status,
            "active_sessions": sessions,
            "joining": state.joining.iter().cloned().collect::<Vec<_>>(),
            "errors": state.errors.iter().cloned().collect::<Vec<_>>(),
            "max_parallel": self.config.max_parallel,
        })
    }

    // ── Internals ───────────────────────────────────────

    async fn transition_meeting<F>(
        &self,
        event_id: &str,
        next: MeetingStatus,
        mutate: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ScheduledMeeting),
    {
        let mut state = self.state.lock().await;
        let meeting = state
            .meetings
            .get_mut(event_id)
            .ok_or_else(|| AppError::NotFound(format!("meeting {event_id}")))?;
        if !meeting.status.can_transition(next) {
            return Err(AppError::InvalidTransition(format!(
                "meeting {event_id}: {} -> {}",
                meeting.status.as_str(),
                next.as_str()
            )));
        }
        meeting.status = next;
        mutate(meeting);
        drop(state);
        self.hub.emit(
            "StatusChanged",
            json!({"event_id": event_id, "status": next.as_str()}),
        );
        Ok(())
    }

    async fn record_error(&self, message: String) {
        let mut state = self.state.lock().await;
        state.errors.push_back(message);
        while state.errors.len() > MAX_ERRORS {
            state.errors.pop_front();
        }
    }

    async fn record_history(
        &self,
        event_id: &str,
        status: &str,
        started_at: Option<DateTime<Utc>>,
    ) {
        let title = {
            let state = self.state.lock().await;
            state
                .meetings
                .get(event_id)
                .map_or_else(String::new, |m| m.title.clone())
        };
        let caption_count = self
            .transcripts
            .count_for_meeting(event_id)
            .await
            .unwrap_or(0);

        let row = MeetingHistoryRow {
            event_id: event_id.to_owned(),
            title,
            started_at,
            ended_at: Some(Utc::now()),
            status: status.to_owned(),
            caption_count,
        };
        if let Err(err) = self.history.record(&row).await {
            warn!(event_id, %err, "meeting history record failed");
        }
    }
}
