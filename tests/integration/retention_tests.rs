//! Time-based purge of processed messages and notification rows.

use std::sync::Arc;

use chrono::Utc;

use botfleet::models::message::{MessageStatus, PendingMessage};
use botfleet::persistence::db;
use botfleet::persistence::notified::NotifiedRepo;
use botfleet::persistence::pending::PendingRepo;
use botfleet::persistence::retention;

fn aged_message(id: &str, status: MessageStatus, processed_hours_ago: i64) -> PendingMessage {
    PendingMessage {
        id: id.to_owned(),
        channel_id: "C1".to_owned(),
        channel_name: "alpha".to_owned(),
        user_id: "U1".to_owned(),
        user_name: "bob".to_owned(),
        text: "aged".to_owned(),
        thread_parent: None,
        is_mention: false,
        is_dm: false,
        matched_keywords: Vec::new(),
        timestamp: id.to_owned(),
        created_at: Utc::now() - chrono::Duration::hours(processed_hours_ago + 1),
        raw_payload: "{}".to_owned(),
        status,
        processed_at: Some(Utc::now() - chrono::Duration::hours(processed_hours_ago)),
    }
}

#[tokio::test]
async fn purge_removes_old_processed_but_keeps_pending() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let pending = PendingRepo::new(Arc::clone(&database));
    let notified = NotifiedRepo::new(Arc::clone(&database));

    // A day-old sent record, a fresh sent record, and a pending one.
    pending
        .insert(&aged_message("900.1", MessageStatus::Sent, 25))
        .await
        .expect("old sent");
    pending
        .insert(&aged_message("900.2", MessageStatus::Sent, 1))
        .await
        .expect("fresh sent");
    let mut still_pending = aged_message("900.3", MessageStatus::Pending, 0);
    still_pending.processed_at = None;
    pending.insert(&still_pending).await.expect("pending");

    notified.mark_notified("C1", "900.1").await.expect("mark");
    // Age the notification row past one hour.
    sqlx::query("UPDATE notified_messages SET notified_at = ?1")
        .bind((Utc::now() - chrono::Duration::hours(2)).to_rfc3339())
        .execute(database.as_ref())
        .await
        .expect("age row");

    let (messages, notifications) = retention::purge_once(&database).await.expect("purge");
    assert_eq!(messages, 1);
    assert_eq!(notifications, 1);

    assert!(!pending.exists("900.1").await.expect("old gone"));
    assert!(pending.exists("900.2").await.expect("fresh kept"));
    assert!(pending.exists("900.3").await.expect("pending kept"));
    assert!(!notified.was_notified("C1", "900.1").await.expect("reaped"));
}
