//! Background sync sweeps under provider rate limits.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use botfleet::config::SyncConfig;
use botfleet::persistence::caches::CacheRepo;
use botfleet::persistence::db;
use botfleet::slack::provider::{MessagingProvider, ProviderChannel};
use botfleet::slack::sync::BackgroundSync;

use super::test_helpers::ScriptedProvider;

fn fast_sync_config() -> SyncConfig {
    SyncConfig {
        sweep_interval_secs: 3600,
        min_delay_secs: 0.0,
        max_delay_secs: 0.01,
        rate_limit_backoff_secs: 2,
        max_members_per_channel: 200,
        skip_dms: true,
    }
}

async fn seeded_provider() -> Arc<ScriptedProvider> {
    let provider = ScriptedProvider::new();
    provider.channels.lock().await.push(ProviderChannel {
        id: "C1".to_owned(),
        name: "alpha".to_owned(),
        purpose: "testing".to_owned(),
        topic: String::new(),
        member_count: 3,
    });
    provider
        .members
        .lock()
        .await
        .insert("C1".to_owned(), vec!["U1".into(), "U2".into(), "U3".into()]);
    for (id, name) in [("U1", "ann"), ("U2", "ben"), ("U3", "cal")] {
        provider.add_user(id, name, &format!("{name}@example.com")).await;
    }
    provider
}

#[tokio::test]
async fn rate_limited_member_fetch_defers_and_retries() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let caches = CacheRepo::new(Arc::clone(&database));

    let mut provider_inner = ScriptedProvider::default();
    provider_inner.rate_limit_user_call = Some((3, 2));
    let provider = Arc::new(provider_inner);
    // Seed channels and members on the configured provider.
    provider.channels.lock().await.push(ProviderChannel {
        id: "C1".to_owned(),
        name: "alpha".to_owned(),
        purpose: String::new(),
        topic: String::new(),
        member_count: 3,
    });
    provider
        .members
        .lock()
        .await
        .insert("C1".to_owned(), vec!["U1".into(), "U2".into(), "U3".into()]);
    for (id, name) in [("U1", "ann"), ("U2", "ben"), ("U3", "cal")] {
        provider.add_user(id, name, &format!("{name}@example.com")).await;
    }

    let photo_dir = tempfile::tempdir().expect("tempdir");
    let sync = BackgroundSync::new(
        fast_sync_config(),
        Arc::clone(&provider) as Arc<dyn MessagingProvider>,
        caches.clone(),
        photo_dir.path().to_path_buf(),
    );

    let started = Instant::now();
    sync.full_sweep(&CancellationToken::new())
        .await
        .expect("sweep");

    // The rate-limited attempt was deferred by at least the reported
    // retry-after, then retried: all three users still landed.
    assert!(started.elapsed().as_secs_f64() >= 2.0);
    assert_eq!(caches.user_count().await.expect("count"), 3);

    let stats = sync.stats().await;
    assert_eq!(stats.rate_limited, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.channels_synced, 1);
}

#[tokio::test]
async fn sweep_skips_dms_and_records_discovery() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let caches = CacheRepo::new(Arc::clone(&database));
    let provider = seeded_provider().await;
    provider.channels.lock().await.push(ProviderChannel {
        id: "D777".to_owned(),
        name: String::new(),
        purpose: String::new(),
        topic: String::new(),
        member_count: 2,
    });

    let photo_dir = tempfile::tempdir().expect("tempdir");
    let sync = BackgroundSync::new(
        fast_sync_config(),
        Arc::clone(&provider) as Arc<dyn MessagingProvider>,
        caches.clone(),
        photo_dir.path().to_path_buf(),
    );

    sync.full_sweep(&CancellationToken::new())
        .await
        .expect("sweep");

    let stats = sync.stats().await;
    assert_eq!(stats.channels_discovered, 2);
    assert_eq!(stats.channels_synced, 1, "dm conversation skipped");
    assert!(caches.get_channel("D777").await.expect("get").is_none());
    assert!(caches.get_channel("C1").await.expect("get").is_some());
}

#[tokio::test]
async fn second_sweep_skips_channels_seen_until_triggered() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let caches = CacheRepo::new(Arc::clone(&database));
    let provider = seeded_provider().await;

    let photo_dir = tempfile::tempdir().expect("tempdir");
    let sync = BackgroundSync::new(
        fast_sync_config(),
        Arc::clone(&provider) as Arc<dyn MessagingProvider>,
        caches,
        photo_dir.path().to_path_buf(),
    );

    let cancel = CancellationToken::new();
    sync.full_sweep(&cancel).await.expect("first sweep");
    sync.full_sweep(&cancel).await.expect("second sweep");
    assert_eq!(sync.stats().await.channels_synced, 0, "seen-set held");

    sync.trigger(botfleet::slack::sync::SyncKind::Channels).await;
    sync.full_sweep(&cancel).await.expect("third sweep");
    assert_eq!(sync.stats().await.channels_synced, 1, "seen-set reset");
}
