//! Per-meeting worker: caption capture, transcript flushing,
//! participant polling, auto-leave.
//!
//! A `MeetingInstance` is owned by the scheduler (which keeps plain
//! event IDs, never back-references) and is stateless across meetings;
//! every active meeting gets its own instance. It exposes no bus
//! surface of its own; everything flows through the scheduler.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::harness::periodic::RobustTimer;
use crate::meet::browser::BrowserHandle;
use crate::meet::devices::DeviceAllocation;
use crate::meet::scheduler::SchedulerEvent;
use crate::meet::siblings::VideoClient;
use crate::models::meeting::TranscriptEntry;
use crate::persistence::meetings::TranscriptRepo;

/// Rapid participant-poll cadence right after join, while the page is
/// still populating its roster.
const PARTICIPANT_RAPID: Duration = Duration::from_secs(2);
/// How long the rapid cadence lasts.
const PARTICIPANT_RAPID_WINDOW: Duration = Duration::from_secs(10);
/// Steady-state participant-poll cadence.
const PARTICIPANT_STEADY: Duration = Duration::from_secs(15);
/// Caption lines retained in memory for `get_captions`.
const RECENT_CAPTIONS: usize = 200;

/// The per-meeting worker.
pub struct MeetingInstance {
    /// Session identifier (uuid), unique per join.
    pub session_id: String,
    /// Owning meeting's event ID.
    pub event_id: String,
    /// Join time.
    pub joined_at: DateTime<Utc>,
    /// When the auto-leave timer fires, if armed.
    pub scheduled_leave_at: Option<DateTime<Utc>>,
    browser: Arc<dyn BrowserHandle>,
    /// Devices owned by this session, returned on stop.
    pub allocation: DeviceAllocation,
    transcripts: TranscriptRepo,
    unflushed: Mutex<Vec<TranscriptEntry>>,
    recent: Mutex<VecDeque<TranscriptEntry>>,
    captions_captured: AtomicU64,
    participants: Mutex<Vec<String>>,
    /// Last requested mute state; the policy lives with the media
    /// collaborator, this only records what was asked.
    muted: Mutex<Option<bool>>,
    flush_entries: usize,
    auto_leave: Mutex<Option<Arc<RobustTimer>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl MeetingInstance {
    /// Start the worker: caption capture, timed flushing, participant
    /// polling, and the auto-leave timer (when an end time is known).
    #[allow(clippy::too_many_arguments)] // Constructor-only wiring.
    pub async fn start(
        session_id: String,
        event_id: String,
        browser: Arc<dyn BrowserHandle>,
        allocation: DeviceAllocation,
        transcripts: TranscriptRepo,
        video: Arc<VideoClient>,
        events: mpsc::UnboundedSender<SchedulerEvent>,
        scheduled_leave_at: Option<DateTime<Utc>>,
        flush_entries: usize,
        flush_interval: Duration,
    ) -> Arc<Self> {
        let instance = Arc::new(Self {
            session_id,
            event_id: event_id.clone(),
            joined_at: Utc::now(),
            scheduled_leave_at,
            browser,
            allocation,
            transcripts,
            unflushed: Mutex::new(Vec::new()),
            recent: Mutex::new(VecDeque::new()),
            captions_captured: AtomicU64::new(0),
            participants: Mutex::new(Vec::new()),
            muted: Mutex::new(None),
            flush_entries,
            auto_leave: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        });

        let mut tasks = Vec::new();
        tasks.push(Self::spawn_caption_capture(&instance).await);
        tasks.push(Self::spawn_flush_loop(&instance, flush_interval));
        tasks.push(Self::spawn_participant_poll(&instance, video, events.clone()));
        *instance.tasks.lock().await = tasks;

        if let Some(leave_at) = scheduled_leave_at {
            let timer_events = events;
            let timer_event_id = event_id;
            let timer = RobustTimer::spawn("auto_leave", move || {
                let events = timer_events.clone();
                let event_id = timer_event_id.clone();
                async move {
                    info!(event_id, "auto-leave timer fired");
                    let _ = events.send(SchedulerEvent::AutoLeave { event_id });
                    Ok(())
                }
            });
            let delay = (leave_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            timer.reschedule(delay).await;
            *instance.auto_leave.lock().await = Some(timer);
        }

        instance
    }

    /// Wind the worker down: stop tasks, flush the transcript buffer,
    /// leave the meeting. Returns total captured caption lines.
    pub async fn stop(&self) -> u64 {
        self.cancel.cancel();
        if let Some(timer) = self.auto_leave.lock().await.take() {
            timer.stop().await;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        self.flush().await;

        if let Err(err) = self.browser.leave().await {
            warn!(session_id = %self.session_id, %err, "browser leave failed");
        }
        self.captions_captured.load(Ordering::Relaxed)
    }

    /// Most recent captured captions, oldest first, up to `limit`.
    pub async fn recent_captions(&self, limit: usize) -> Vec<TranscriptEntry> {
        let recent = self.recent.lock().await;
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    /// Last observed participant roster.
    pub async fn participants(&self) -> Vec<String> {
        self.participants.lock().await.clone()
    }

    /// Total caption lines captured so far.
    #[must_use]
    pub fn caption_count(&self) -> u64 {
        self.captions_captured.load(Ordering::Relaxed)
    }

    /// Request microphone mute from the browser collaborator.
    pub async fn mute(&self) -> crate::Result<()> {
        self.browser.mute().await?;
        *self.muted.lock().await = Some(true);
        Ok(())
    }

    /// Request microphone unmute from the browser collaborator.
    pub async fn unmute(&self) -> crate::Result<()> {
        self.browser.unmute().await?;
        *self.muted.lock().await = Some(false);
        Ok(())
    }

    /// Last requested mute state; `None` when never requested.
    pub async fn muted(&self) -> Option<bool> {
        *self.muted.lock().await
    }

    /// Whether the underlying page has gone away.
    pub async fn browser_closed(&self) -> bool {
        self.browser.is_closed().await
    }

    async fn spawn_caption_capture(instance: &Arc<Self>) -> JoinHandle<()> {
        let instance = Arc::clone(instance);
        let receiver = instance.browser.take_captions().await;
        tokio::spawn(async move {
            let Some(mut receiver) = receiver else {
                debug!(session_id = %instance.session_id, "no caption stream available");
                return;
            };
            loop {
                tokio::select! {
                    () = instance.cancel.cancelled() => break,
                    caption = receiver.recv() => {
                        let Some(caption) = caption else { break };
                        instance.record_caption(caption).await;
                    }
                }
            }
        })
    }

    async fn record_caption(&self, caption: crate::meet::browser::CaptionEntry) {
        let entry = TranscriptEntry {
            meeting_id: self.event_id.clone(),
            speaker: caption.speaker,
            text: caption.text,
            timestamp: caption.captured_at,
        };
        self.captions_captured.fetch_add(1, Ordering::Relaxed);
        {
            let mut recent = self.recent.lock().await;
            recent.push_back(entry.clone());
            while recent.len() > RECENT_CAPTIONS {
                recent.pop_front();
            }
        }
        let should_flush = {
            let mut unflushed = self.unflushed.lock().await;
            unflushed.push(entry);
            unflushed.len() >= self.flush_entries
        };
        if should_flush {
            self.flush().await;
        }
    }

    fn spawn_flush_loop(instance: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let instance = Arc::clone(instance);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = instance.cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => instance.flush().await,
                }
            }
        })
    }

    fn spawn_participant_poll(
        instance: &Arc<Self>,
        video: Arc<VideoClient>,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> JoinHandle<()> {
        let instance = Arc::clone(instance);
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            loop {
                let cadence = if started.elapsed() < PARTICIPANT_RAPID_WINDOW {
                    PARTICIPANT_RAPID
                } else {
                    PARTICIPANT_STEADY
                };
                tokio::select! {
                    () = instance.cancel.cancelled() => break,
                    () = tokio::time::sleep(cadence) => {}
                }

                if instance.browser.is_closed().await {
                    info!(event_id = %instance.event_id, "browser window closed");
                    let _ = events.send(SchedulerEvent::BrowserClosed {
                        event_id: instance.event_id.clone(),
                    });
                    break;
                }

                match instance.browser.participants().await {
                    Ok(roster) => {
                        let changed = {
                            let mut participants = instance.participants.lock().await;
                            let changed = *participants != roster;
                            *participants = roster.clone();
                            changed
                        };
                        if changed {
                            video.update_attendees(&roster).await;
                        }
                    }
                    Err(err) => debug!(%err, "participant poll failed"),
                }
            }
        })
    }

    async fn flush(&self) {
        let batch: Vec<TranscriptEntry> = {
            let mut unflushed = self.unflushed.lock().await;
            unflushed.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }
        if let Err(err) = self.transcripts.append(&batch).await {
            warn!(
                session_id = %self.session_id,
                count = batch.len(),
                %err,
                "transcript flush failed; entries dropped"
            );
        }
    }
}
