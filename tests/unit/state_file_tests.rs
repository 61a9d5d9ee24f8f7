//! Atomic state-file publication.

use serde_json::{json, Value};

use botfleet::harness::state_file::{atomic_write_json, StatePublisher};

#[test]
fn atomic_write_replaces_whole_document() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("slack_state.json");

    atomic_write_json(&path, &json!({"status": "ok", "pending": 2})).expect("first write");
    atomic_write_json(&path, &json!({"status": "degraded"})).expect("second write");

    let raw = std::fs::read_to_string(&path).expect("read");
    let parsed: Value = serde_json::from_str(&raw).expect("parse");
    assert_eq!(parsed["status"], json!("degraded"));
    assert!(parsed.get("pending").is_none());
}

#[test]
fn atomic_write_creates_missing_parent_dirs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("meet_state.json");

    atomic_write_json(&path, &json!({"status": "idle"})).expect("write");
    assert!(path.exists());
}

#[tokio::test]
async fn publish_now_writes_provider_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("meet_state.json");
    let publisher = StatePublisher::spawn(path.clone(), || async { json!({"status": "idle"}) });

    publisher.publish_now().await.expect("publish");
    let raw = std::fs::read_to_string(&path).expect("read");
    assert!(raw.contains("idle"));
    publisher.stop().await;
}
