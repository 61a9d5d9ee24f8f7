//! Scheduler state-machine flows against scripted calendars and an
//! instant browser.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use botfleet::bus::SignalHub;
use botfleet::config::{CalendarEntry, MeetConfig};
use botfleet::meet::devices::LoopbackAllocator;
use botfleet::meet::scheduler::MeetingScheduler;
use botfleet::meet::siblings::VideoClient;
use botfleet::models::meeting::MeetingStatus;
use botfleet::persistence::db::{self, Database};
use botfleet::persistence::meetings::{MeetingHistoryRepo, TranscriptRepo};
use botfleet::AppError;

use super::test_helpers::{wait_until, InstantLauncher, ScriptedCalendar};

struct SchedulerFixture {
    scheduler: Arc<MeetingScheduler>,
    calendar: Arc<ScriptedCalendar>,
    launcher: Arc<InstantLauncher>,
    #[allow(dead_code)]
    db: Arc<Database>,
    history: MeetingHistoryRepo,
}

async fn fixture(config: MeetConfig) -> SchedulerFixture {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let calendar = ScriptedCalendar::new();
    let launcher = InstantLauncher::new();
    let history = MeetingHistoryRepo::new(Arc::clone(&database));

    let scheduler = MeetingScheduler::new(
        config,
        Arc::clone(&calendar) as _,
        Arc::clone(&launcher) as _,
        LoopbackAllocator::new(8),
        Arc::new(VideoClient::for_daemon("video-test-absent")),
        TranscriptRepo::new(Arc::clone(&database)),
        history.clone(),
        SignalHub::new(),
    );
    scheduler.spawn_event_loop().await;

    SchedulerFixture {
        scheduler,
        calendar,
        launcher,
        db: database,
        history,
    }
}

fn watched_config() -> MeetConfig {
    MeetConfig {
        calendars: vec![CalendarEntry {
            calendar_id: "cal-1".to_owned(),
            display_name: "Primary".to_owned(),
            enabled: true,
            auto_join: false,
            bot_mode: "notes".to_owned(),
        }],
        pre_roll_secs: 30,
        grace_secs: 1,
        ..MeetConfig::default()
    }
}

const URL: &str = "https://meet.google.com/abc-defg-hij";

#[tokio::test]
async fn calendar_event_projects_and_approves_and_joins() {
    let f = fixture(watched_config()).await;
    let start = Utc::now() + chrono::Duration::seconds(20);
    f.calendar
        .add_event("evt-1", "Standup", start, Some(start + chrono::Duration::minutes(30)), URL)
        .await;

    f.scheduler.poll_calendars().await.expect("poll");
    let meetings = f.scheduler.meetings().await;
    assert_eq!(meetings.len(), 1);
    assert_eq!(meetings[0].status, MeetingStatus::Scheduled);

    f.scheduler
        .approve("evt-1", "notes", "tester")
        .await
        .expect("approve");

    // Start is inside the pre-roll window, so the next tick joins.
    f.scheduler.tick().await.expect("tick");
    let joined = wait_until(Duration::from_secs(3), || async {
        f.scheduler.meetings().await[0].status == MeetingStatus::Active
    })
    .await;
    assert!(joined, "meeting did not reach active");
    assert_eq!(f.launcher.join_count().await, 1);
}

#[tokio::test]
async fn events_without_valid_urls_are_rejected_at_ingest() {
    let f = fixture(watched_config()).await;
    let start = Utc::now() + chrono::Duration::minutes(5);
    f.calendar
        .add_event("evt-bad", "No conference", start, None, "https://example.com/x")
        .await;

    f.scheduler.poll_calendars().await.expect("poll");
    assert!(f.scheduler.meetings().await.is_empty());
}

#[tokio::test]
async fn updates_refresh_nonterminal_meetings_in_place() {
    let f = fixture(watched_config()).await;
    let start = Utc::now() + chrono::Duration::minutes(10);
    f.calendar.add_event("evt-2", "Old title", start, None, URL).await;
    f.scheduler.poll_calendars().await.expect("poll");

    f.calendar.events.lock().await[0].title = "New title".to_owned();
    f.scheduler.poll_calendars().await.expect("re-poll");

    let meetings = f.scheduler.meetings().await;
    assert_eq!(meetings.len(), 1);
    assert_eq!(meetings[0].title, "New title");
}

#[tokio::test]
async fn skip_is_terminal_and_blocks_approval() {
    let f = fixture(watched_config()).await;
    let start = Utc::now() + chrono::Duration::minutes(10);
    f.calendar.add_event("evt-3", "Skippable", start, None, URL).await;
    f.scheduler.poll_calendars().await.expect("poll");

    f.scheduler.skip("evt-3").await.expect("skip");
    let denied = f.scheduler.approve("evt-3", "notes", "tester").await;
    assert!(matches!(denied, Err(AppError::InvalidTransition(_))));

    // Terminal meetings are not refreshed by later polls.
    f.calendar.events.lock().await[0].title = "Changed".to_owned();
    f.scheduler.poll_calendars().await.expect("re-poll");
    assert_eq!(f.scheduler.meetings().await[0].title, "Skippable");
}

#[tokio::test]
async fn concurrency_cap_holds_and_ties_break_by_event_id() {
    let mut config = watched_config();
    config.max_parallel = 1;
    let f = fixture(config).await;

    let start = Utc::now();
    f.calendar.add_event("evt-b", "Second by id", start, None, URL).await;
    f.calendar.add_event("evt-a", "First by id", start, None, URL).await;
    f.scheduler.poll_calendars().await.expect("poll");

    f.scheduler.approve("evt-a", "notes", "t").await.expect("a");
    f.scheduler.approve("evt-b", "notes", "t").await.expect("b");

    f.scheduler.tick().await.expect("tick");
    let one_active = wait_until(Duration::from_secs(3), || async {
        f.scheduler.meetings().await.iter().any(|m| m.status == MeetingStatus::Active)
    })
    .await;
    assert!(one_active);

    let meetings = f.scheduler.meetings().await;
    let active: Vec<&str> = meetings
        .iter()
        .filter(|m| m.status == MeetingStatus::Active)
        .map(|m| m.event_id.as_str())
        .collect();
    let held: Vec<&str> = meetings
        .iter()
        .filter(|m| m.status == MeetingStatus::Approved)
        .map(|m| m.event_id.as_str())
        .collect();
    assert_eq!(active, vec!["evt-a"], "lexicographic tie-break");
    assert_eq!(held, vec!["evt-b"], "cap holds the second meeting");
}

#[tokio::test]
async fn past_end_plus_grace_completes_with_history() {
    let f = fixture(watched_config()).await;
    let start = Utc::now() - chrono::Duration::seconds(10);
    let end = Utc::now() + chrono::Duration::seconds(1);
    f.calendar.add_event("evt-4", "Short", start, Some(end), URL).await;
    f.scheduler.poll_calendars().await.expect("poll");
    f.scheduler.approve("evt-4", "notes", "t").await.expect("approve");

    f.scheduler.tick().await.expect("join tick");
    assert!(
        wait_until(Duration::from_secs(3), || async {
            f.scheduler.meetings().await[0].status == MeetingStatus::Active
        })
        .await
    );

    // Wait out end + grace (1 s), then tick again.
    tokio::time::sleep(Duration::from_millis(2300)).await;
    f.scheduler.tick().await.expect("leave tick");

    assert!(
        wait_until(Duration::from_secs(3), || async {
            f.scheduler.meetings().await[0].status == MeetingStatus::Completed
        })
        .await
    );
    let meeting = &f.scheduler.meetings().await[0];
    assert!(meeting.actual_end.is_some());

    let history = f.history.recent(5).await.expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "completed");
}

#[tokio::test]
async fn adhoc_join_without_end_needs_manual_leave() {
    let f = fixture(watched_config()).await;
    let event_id = f
        .scheduler
        .join_adhoc(URL, "Warroom", "notes", false)
        .await
        .expect("adhoc");

    assert!(
        wait_until(Duration::from_secs(3), || async {
            f.scheduler
                .meetings()
                .await
                .iter()
                .any(|m| m.event_id == event_id && m.status == MeetingStatus::Active)
        })
        .await
    );

    // No scheduled end: ticks never complete it.
    f.scheduler.tick().await.expect("tick");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        f.scheduler
            .meetings()
            .await
            .iter()
            .find(|m| m.event_id == event_id)
            .map(|m| m.status),
        Some(MeetingStatus::Active)
    );

    // Manual leave by session ID ends it.
    let rosters = f.scheduler.participants().await;
    let session_id = rosters.keys().next().cloned().expect("session");
    f.scheduler.leave_by_session(&session_id).await.expect("leave");
    assert_eq!(
        f.scheduler
            .meetings()
            .await
            .iter()
            .find(|m| m.event_id == event_id)
            .map(|m| m.status),
        Some(MeetingStatus::Completed)
    );
}

#[tokio::test]
async fn adhoc_join_rejects_non_conference_urls() {
    let f = fixture(watched_config()).await;
    let rejected = f
        .scheduler
        .join_adhoc("https://example.com/nope", "Bad", "notes", false)
        .await;
    assert!(matches!(rejected, Err(AppError::Calendar(_))));
}

#[tokio::test]
async fn wake_cleans_up_sessions_whose_browser_died() {
    let f = fixture(watched_config()).await;
    let event_id = f
        .scheduler
        .join_adhoc(URL, "Dies in sleep", "notes", false)
        .await
        .expect("adhoc");
    assert!(
        wait_until(Duration::from_secs(3), || async {
            f.scheduler
                .meetings()
                .await
                .iter()
                .any(|m| m.event_id == event_id && m.status == MeetingStatus::Active)
        })
        .await
    );

    // The browser dies while the machine sleeps.
    let browser = f.launcher.last_browser().await.expect("browser");
    browser.closed.store(true, std::sync::atomic::Ordering::SeqCst);

    f.scheduler.on_wake().await;
    assert_eq!(
        f.scheduler
            .meetings()
            .await
            .iter()
            .find(|m| m.event_id == event_id)
            .map(|m| m.status),
        Some(MeetingStatus::Completed)
    );
}

#[tokio::test]
async fn captions_flow_into_buffers_and_mute_is_tracked() {
    let f = fixture(watched_config()).await;
    f.scheduler
        .join_adhoc(URL, "Caption test", "notes", false)
        .await
        .expect("adhoc");
    assert!(
        wait_until(Duration::from_secs(3), || async {
            !f.scheduler.participants().await.is_empty()
        })
        .await
    );

    let browser = f.launcher.last_browser().await.expect("browser");
    browser
        .captions_tx
        .send(botfleet::meet::browser::CaptionEntry {
            speaker: "Alice".to_owned(),
            text: "hello everyone".to_owned(),
            captured_at: Utc::now(),
        })
        .await
        .expect("caption send");

    assert!(
        wait_until(Duration::from_secs(2), || async {
            !f.scheduler.captions(10).await.is_empty()
        })
        .await
    );
    let captions = f.scheduler.captions(10).await;
    assert_eq!(captions[0].text, "hello everyone");

    let session_id = f
        .scheduler
        .participants()
        .await
        .keys()
        .next()
        .cloned()
        .expect("session");
    f.scheduler.mute(&session_id).await.expect("mute");
    assert_eq!(
        f.scheduler.audio_state(&session_id).await.expect("state"),
        Some(true)
    );
    f.scheduler.unmute(&session_id).await.expect("unmute");
    assert_eq!(
        f.scheduler.audio_state(&session_id).await.expect("state"),
        Some(false)
    );
}

#[tokio::test]
async fn force_join_bypasses_the_pre_roll_window() {
    let f = fixture(watched_config()).await;
    // Starts far outside the pre-roll window.
    let start = Utc::now() + chrono::Duration::hours(2);
    f.calendar.add_event("evt-5", "Later", start, None, URL).await;
    f.scheduler.poll_calendars().await.expect("poll");

    f.scheduler.force_join("evt-5").await.expect("force");
    assert!(
        wait_until(Duration::from_secs(3), || async {
            f.scheduler.meetings().await[0].status == MeetingStatus::Active
        })
        .await
    );
}
