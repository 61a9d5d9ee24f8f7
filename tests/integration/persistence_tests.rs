//! Store-level invariants: idempotent bulk upserts, one-way message
//! transitions, idempotent schema bootstrap.

use std::sync::Arc;

use chrono::Utc;

use botfleet::models::cache::{CachedChannel, CachedUser};
use botfleet::models::message::{MessageStatus, PendingMessage};
use botfleet::persistence::caches::CacheRepo;
use botfleet::persistence::db;
use botfleet::persistence::pending::PendingRepo;
use botfleet::persistence::schema;
use botfleet::AppError;

fn sample_message(id_suffix: &str) -> PendingMessage {
    PendingMessage {
        id: format!("C1|100.{id_suffix}"),
        channel_id: "C1".to_owned(),
        channel_name: "alpha".to_owned(),
        user_id: "U1".to_owned(),
        user_name: "bob".to_owned(),
        text: "hello there".to_owned(),
        thread_parent: None,
        is_mention: false,
        is_dm: false,
        matched_keywords: vec!["hello".to_owned()],
        timestamp: format!("100.{id_suffix}"),
        created_at: Utc::now(),
        raw_payload: "{}".to_owned(),
        status: MessageStatus::Pending,
        processed_at: None,
    }
}

fn user(id: &str, name: &str) -> CachedUser {
    CachedUser {
        user_id: id.to_owned(),
        user_name: name.to_owned(),
        display_name: name.to_owned(),
        real_name: format!("{name} surname"),
        email: format!("{name}@example.com"),
        avatar_url: String::new(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn bulk_user_upsert_is_idempotent() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let caches = CacheRepo::new(database);

    let users = vec![user("U1", "bob"), user("U2", "alice")];
    caches.cache_users(&users).await.expect("first upsert");
    caches.cache_users(&users).await.expect("second upsert");

    assert_eq!(caches.user_count().await.expect("count"), 2);
    let fetched = caches.get_user("U1").await.expect("get").expect("exists");
    assert_eq!(fetched.user_name, "bob");
}

#[tokio::test]
async fn bulk_channel_upsert_overwrites_by_id() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let caches = CacheRepo::new(database);

    let mut channel = CachedChannel {
        channel_id: "C1".to_owned(),
        name: "alpha".to_owned(),
        purpose: String::new(),
        topic: String::new(),
        member_count: 3,
        updated_at: Utc::now(),
    };
    caches
        .cache_channels(std::slice::from_ref(&channel))
        .await
        .expect("insert");

    channel.name = "alpha-renamed".to_owned();
    channel.member_count = 5;
    caches
        .cache_channels(std::slice::from_ref(&channel))
        .await
        .expect("update");

    assert_eq!(caches.channel_count().await.expect("count"), 1);
    let fetched = caches
        .get_channel("C1")
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(fetched.name, "alpha-renamed");
    assert_eq!(fetched.member_count, 5);
}

#[tokio::test]
async fn message_transitions_are_one_way() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let pending = PendingRepo::new(database);

    let message = sample_message("001");
    pending.insert(&message).await.expect("insert");

    // pending -> sent directly is not an allowed edge.
    let direct = pending.transition(&message.id, MessageStatus::Sent).await;
    assert!(matches!(direct, Err(AppError::InvalidTransition(_))));

    pending
        .transition(&message.id, MessageStatus::Approved)
        .await
        .expect("approve");
    let sent = pending
        .transition(&message.id, MessageStatus::Sent)
        .await
        .expect("send");
    assert_eq!(sent.status, MessageStatus::Sent);
    assert!(sent.processed_at.is_some(), "sent implies processed_at");

    // Terminal records never rewind.
    let rewind = pending
        .transition(&message.id, MessageStatus::Pending)
        .await;
    assert!(rewind.is_err());
}

#[tokio::test]
async fn rejected_records_are_stamped() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let pending = PendingRepo::new(database);

    let message = sample_message("002");
    pending.insert(&message).await.expect("insert");
    let rejected = pending
        .transition(&message.id, MessageStatus::Rejected)
        .await
        .expect("reject");
    assert!(rejected.processed_at.is_some());
}

#[tokio::test]
async fn schema_bootstrap_is_convergent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.db").to_string_lossy().to_string();

    let first = db::connect(&path).await.expect("first open");
    schema::bootstrap_schema(&first).await.expect("re-bootstrap");
    drop(first);

    // Reopening applies the schema again without error or data change.
    let second = db::connect(&path).await.expect("second open");
    let pending = PendingRepo::new(Arc::new(second));
    pending.insert(&sample_message("003")).await.expect("insert");
    assert!(pending.exists("C1|100.003").await.expect("exists"));
}

#[tokio::test]
async fn fuzzy_search_ranks_and_thresholds() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let caches = CacheRepo::new(database);
    caches
        .cache_users(&[user("U1", "jonathan"), user("U2", "xavier")])
        .await
        .expect("seed");

    let hits = caches
        .find_users_fuzzy("jonathon", 0.7, 5)
        .await
        .expect("fuzzy");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0.user_id, "U1");
    assert!(hits[0].1 > 0.7);

    let misses = caches.find_users_fuzzy("zzz", 0.7, 5).await.expect("fuzzy");
    assert!(misses.is_empty());
}
