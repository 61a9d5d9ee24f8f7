//! Full daemon wiring exercised over a real bus socket: build, start,
//! dispatch domain methods through a client, observe state, shut down.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use botfleet::bus::client::BusClient;
use botfleet::bus::server::BusServer;
use botfleet::bus::{MethodRegistry, SignalHub};
use botfleet::config::GlobalConfig;
use botfleet::harness::Daemon;
use botfleet::meet::browser::OfflineLauncher;
use botfleet::meet::calendar::OfflineCalendar;
use botfleet::meet::daemon::MeetDaemon;
use botfleet::meet::devices::LoopbackAllocator;
use botfleet::meet::siblings::VideoClient;
use botfleet::slack::daemon::SlackDaemon;
use botfleet::slack::notifier::NullNotifier;
use botfleet::slack::provider::{OfflineProvider, TemplateResponder};

use super::test_helpers::wait_until;

fn scratch_socket(tag: &str) -> String {
    format!("botfleet-test-{tag}-{}", uuid::Uuid::new_v4())
}

fn scratch_config(dir: &std::path::Path) -> GlobalConfig {
    let mut config = GlobalConfig::from_json_str("{}").expect("defaults");
    config.data_dir = dir.join("data");
    config.cache_dir = dir.join("cache");
    config.runtime_dir = dir.join("run");
    config
}

async fn serve(daemon: &Arc<dyn Daemon>, socket: &str, hub: SignalHub, cancel: CancellationToken) {
    let mut registry = MethodRegistry::new();
    daemon.register_methods(&mut registry);
    BusServer::spawn(socket, registry, hub, cancel).expect("bus server");
}

#[tokio::test]
async fn slack_daemon_serves_its_domain_surface() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = scratch_config(dir.path());
    let hub = SignalHub::new();

    let daemon = SlackDaemon::build(
        &config,
        dir.path().join("config.json"),
        Arc::new(OfflineProvider),
        Arc::new(TemplateResponder),
        Arc::new(NullNotifier),
        hub.clone(),
    )
    .await
    .expect("build");

    daemon.startup().await.expect("startup");

    let socket = scratch_socket("slackd");
    let cancel = CancellationToken::new();
    let as_daemon: Arc<dyn Daemon> = Arc::clone(&daemon) as _;
    serve(&as_daemon, &socket, hub, cancel.clone()).await;

    let mut client = BusClient::connect_socket(&socket).await.expect("connect");

    let pending = client.call("get_pending", json!({})).await.expect("call");
    assert_eq!(pending["success"], json!(true));
    assert_eq!(pending["count"], json!(0));

    let stats = client.call("get_cache_stats", json!({})).await.expect("call");
    assert_eq!(stats["success"], json!(true));
    assert_eq!(stats["channels"], json!(0));

    let miss = client
        .call("resolve_target", json!({"target": "#nowhere"}))
        .await
        .expect("call");
    assert_eq!(miss["success"], json!(true));
    assert_eq!(miss["found"], json!(false));

    let bad_args = client.call("approve_message", json!({})).await.expect("call");
    assert_eq!(bad_args["success"], json!(false));

    // In-process accessors agree with the bus view.
    assert_eq!(daemon.queue().pending_count().await, 0);
    assert_eq!(daemon.listener().stats().await.consecutive_errors, 0);

    let state = daemon.current_state().await;
    assert!(state.get("updated_at").is_some());
    assert_eq!(state["status"], json!("running"));
    assert!(state.get("pending_count").is_some());

    // The first listener tick runs shortly after startup; health needs it.
    let polled = wait_until(std::time::Duration::from_secs(3), || async {
        daemon.listener().stats().await.polls >= 1
    })
    .await;
    assert!(polled, "first listener tick never completed");

    let health = daemon.health_check().await;
    assert!(health.checks.contains_key("store_reachable"));
    assert!(health.healthy);

    cancel.cancel();
    daemon.shutdown().await;
    assert_eq!(daemon.current_state().await["status"], json!("stopped"));
}

#[tokio::test]
async fn meet_daemon_serves_its_domain_surface() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = scratch_config(dir.path());
    let hub = SignalHub::new();

    let daemon = MeetDaemon::build(
        &config,
        Arc::new(OfflineCalendar),
        Arc::new(OfflineLauncher),
        LoopbackAllocator::new(2),
        Arc::new(VideoClient::for_daemon("video-absent-test")),
        hub.clone(),
    )
    .await
    .expect("build");

    daemon.startup().await.expect("startup");

    let socket = scratch_socket("meetd");
    let cancel = CancellationToken::new();
    let as_daemon: Arc<dyn Daemon> = Arc::clone(&daemon) as _;
    serve(&as_daemon, &socket, hub, cancel.clone()).await;

    let mut client = BusClient::connect_socket(&socket).await.expect("connect");

    let meetings = client.call("list_meetings", json!({})).await.expect("call");
    assert_eq!(meetings["success"], json!(true));
    assert_eq!(meetings["count"], json!(0));

    let unknown = client
        .call("approve_meeting", json!({"event_id": "evt-x"}))
        .await
        .expect("call");
    assert_eq!(unknown["success"], json!(false));

    let bad_url = client
        .call("join_meeting", json!({"url": "https://example.com/x"}))
        .await
        .expect("call");
    assert_eq!(bad_url["success"], json!(false));

    // The offline launcher fails every attempt; the meeting lands in
    // error after the retry budget, not in active.
    let joining = client
        .call(
            "join_meeting",
            json!({"url": "https://meet.google.com/abc-defg-hij", "title": "Doomed"}),
        )
        .await
        .expect("call");
    assert_eq!(joining["success"], json!(true));
    assert_eq!(joining["status"], json!("joining"));
    let event_id = joining["event_id"].as_str().expect("event id").to_owned();
    let listed: Vec<Value> = daemon
        .scheduler()
        .meetings()
        .await
        .into_iter()
        .map(|m| serde_json::to_value(m).expect("meeting json"))
        .collect();
    assert!(listed.iter().any(|m| m["event_id"] == json!(event_id)));

    let history = client
        .call("get_meeting_history", json!({"limit": 5}))
        .await
        .expect("call");
    assert_eq!(history["success"], json!(true));

    let calendars = client.call("list_calendars", json!({})).await.expect("call");
    assert_eq!(calendars["count"], json!(0));

    let health = daemon.health_check().await;
    assert!(health.healthy);

    cancel.cancel();
    daemon.shutdown().await;
}
