//! Target resolution over the discovery caches.

use std::sync::Arc;

use chrono::Utc;

use botfleet::models::cache::{CachedChannel, CachedGroup, CachedUser};
use botfleet::persistence::caches::CacheRepo;
use botfleet::persistence::db;
use botfleet::persistence::resolve::resolve_target;

async fn seeded_caches() -> CacheRepo {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let caches = CacheRepo::new(database);

    caches
        .cache_channels(&[CachedChannel {
            channel_id: "C1".to_owned(),
            name: "alpha".to_owned(),
            purpose: String::new(),
            topic: String::new(),
            member_count: 2,
            updated_at: Utc::now(),
        }])
        .await
        .expect("channels");

    caches
        .cache_users(&[CachedUser {
            user_id: "U1".to_owned(),
            user_name: "bob".to_owned(),
            display_name: "Bob".to_owned(),
            real_name: "Bob Example".to_owned(),
            email: "bob@example.com".to_owned(),
            avatar_url: String::new(),
            updated_at: Utc::now(),
        }])
        .await
        .expect("users");

    caches
        .cache_groups(&[CachedGroup {
            group_id: "S0123456789".to_owned(),
            handle: "oncall".to_owned(),
            name: "On-call".to_owned(),
            members: vec!["U1".to_owned()],
            updated_at: Utc::now(),
        }])
        .await
        .expect("groups");

    caches
}

#[tokio::test]
async fn hash_prefix_resolves_channels() {
    let caches = seeded_caches().await;
    let hit = resolve_target(&caches, "#alpha").await.expect("resolve");
    assert!(hit.found);
    assert_eq!(hit.kind, "channel");
    assert_eq!(hit.id.as_deref(), Some("C1"));
    assert_eq!(hit.source, "channel_cache");

    // Case-insensitive fallback.
    let ci = resolve_target(&caches, "#ALPHA").await.expect("resolve");
    assert!(ci.found);
    assert_eq!(ci.id.as_deref(), Some("C1"));
}

#[tokio::test]
async fn at_prefix_prefers_groups_then_users() {
    let caches = seeded_caches().await;

    let group = resolve_target(&caches, "@oncall").await.expect("resolve");
    assert_eq!(group.kind, "group");
    assert_eq!(group.id.as_deref(), Some("S0123456789"));
    assert_eq!(group.source, "group_cache");

    let user = resolve_target(&caches, "@bob").await.expect("resolve");
    assert_eq!(user.kind, "user");
    assert_eq!(user.id.as_deref(), Some("U1"));
    assert_eq!(user.source, "user_cache");

    let miss = resolve_target(&caches, "@nobody").await.expect("resolve");
    assert!(!miss.found);
    assert_eq!(miss.kind, "unknown");
    assert_eq!(miss.source, "not_found");
}

#[tokio::test]
async fn raw_ids_pass_through() {
    let caches = seeded_caches().await;

    let channel = resolve_target(&caches, "C0123456789").await.expect("resolve");
    assert_eq!(channel.kind, "channel");
    assert_eq!(channel.source, "raw_id");

    let dm = resolve_target(&caches, "D0123456789").await.expect("resolve");
    assert_eq!(dm.kind, "dm");

    let user = resolve_target(&caches, "U0123456789").await.expect("resolve");
    assert_eq!(user.kind, "user");
}

#[tokio::test]
async fn bare_names_try_channel_then_user() {
    let caches = seeded_caches().await;

    let channel = resolve_target(&caches, "alpha").await.expect("resolve");
    assert_eq!(channel.kind, "channel");

    let user = resolve_target(&caches, "bob").await.expect("resolve");
    assert_eq!(user.kind, "user");

    let miss = resolve_target(&caches, "nothing-here").await.expect("resolve");
    assert!(!miss.found);
}

#[tokio::test]
async fn resolution_is_stable_across_calls() {
    let caches = seeded_caches().await;
    let first = resolve_target(&caches, "@bob").await.expect("resolve");
    let second = resolve_target(&caches, "@bob").await.expect("resolve");
    assert_eq!(first, second);
}
