//! Background cache warmer.
//!
//! Slowly walks the user's sidebar: channel discovery, member fetch,
//! avatar photo download: pausing a uniform random delay between
//! channels so the provider's rate limiter is never provoked. A 429
//! waits out the configured backoff and retries the same item without
//! counting a failure; other errors count and the sweep moves on.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::models::cache::{CachedChannel, CachedGroup, CachedUser};
use crate::models::stats::SyncStats;
use crate::persistence::caches::CacheRepo;
use crate::slack::provider::MessagingProvider;
use crate::{AppError, Result};

/// Cap on one photo download.
const PHOTO_TIMEOUT: Duration = Duration::from_secs(30);
/// Page size for channel discovery.
const DISCOVERY_PAGE: u32 = 200;

/// Which seen-set a `trigger_sync` call resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Everything.
    Full,
    /// Channel discovery and member fetch.
    Channels,
    /// User records.
    Users,
    /// Avatar photos.
    Photos,
}

impl SyncKind {
    /// Parse the bus argument form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "channels" => Some(Self::Channels),
            "users" => Some(Self::Users),
            "photos" => Some(Self::Photos),
            _ => None,
        }
    }
}

/// The background sync component. One per slack daemon.
pub struct BackgroundSync {
    config: SyncConfig,
    provider: Arc<dyn MessagingProvider>,
    caches: CacheRepo,
    photo_dir: PathBuf,
    http: reqwest::Client,
    stats: Mutex<SyncStats>,
    seen_channels: Mutex<HashSet<String>>,
    seen_photos: Mutex<HashSet<String>>,
    running: Mutex<Option<CancellationToken>>,
    // For handing an owned clone to the sweep-loop task.
    self_weak: Weak<Self>,
}

impl BackgroundSync {
    /// Wire up the sync component.
    #[must_use]
    pub fn new(
        config: SyncConfig,
        provider: Arc<dyn MessagingProvider>,
        caches: CacheRepo,
        photo_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            config,
            provider,
            caches,
            photo_dir,
            http: reqwest::Client::new(),
            stats: Mutex::new(SyncStats::default()),
            seen_channels: Mutex::new(HashSet::new()),
            seen_photos: Mutex::new(HashSet::new()),
            running: Mutex::new(None),
            self_weak: self_weak.clone(),
        })
    }

    /// Snapshot of the sweep counters.
    pub async fn stats(&self) -> SyncStats {
        self.stats.lock().await.clone()
    }

    /// Start the sweep loop. A no-op when already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let Some(sync) = self.self_weak.upgrade() else {
            return;
        };
        let cancel = CancellationToken::new();
        *running = Some(cancel.clone());
        self.stats.lock().await.running = true;
        let interval = Duration::from_secs(self.config.sweep_interval_secs);
        tokio::spawn(async move {
            loop {
                if let Err(err) = sync.full_sweep(&cancel).await {
                    warn!(%err, "sync sweep failed");
                    sync.stats.lock().await.errors += 1;
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            sync.stats.lock().await.running = false;
            info!("background sync stopped");
        });
        info!("background sync started");
    }

    /// Stop the loop; in-flight work is cancelled at its next delay
    /// boundary.
    pub async fn stop(&self) {
        if let Some(cancel) = self.running.lock().await.take() {
            cancel.cancel();
        }
    }

    /// Reset the seen-set for `kind` so the next sweep re-covers it.
    pub async fn trigger(&self, kind: SyncKind) {
        match kind {
            SyncKind::Full => {
                self.seen_channels.lock().await.clear();
                self.seen_photos.lock().await.clear();
            }
            SyncKind::Channels | SyncKind::Users => {
                self.seen_channels.lock().await.clear();
            }
            SyncKind::Photos => {
                self.seen_photos.lock().await.clear();
            }
        }
        info!(?kind, "sync seen-set reset");
    }

    /// One full sweep: discovery → per-channel member sync → photos.
    ///
    /// # Errors
    ///
    /// Returns the first wholesale failure (discovery); per-item errors
    /// are absorbed into stats.
    pub async fn full_sweep(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let mut stats = self.stats.lock().await;
            stats.last_sweep_started = Some(Utc::now());
            stats.channels_discovered = 0;
            stats.channels_synced = 0;
        }

        let channels = self.discover_channels().await?;
        self.stats.lock().await.channels_discovered = channels.len() as u64;

        for channel in channels {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if self.seen_channels.lock().await.contains(&channel.id) {
                continue;
            }
            if self.config.skip_dms && channel.id.starts_with('D') {
                debug!(channel_id = %channel.id, "dm skipped");
                continue;
            }

            match self.sync_channel(&channel.id, cancel).await {
                Ok(()) => {
                    self.seen_channels.lock().await.insert(channel.id.clone());
                    self.stats.lock().await.channels_synced += 1;
                }
                Err(err) => {
                    warn!(channel_id = %channel.id, %err, "channel sync failed");
                    self.stats.lock().await.errors += 1;
                }
            }

            if self.pace(cancel).await {
                return Ok(());
            }
        }

        self.sync_groups().await;
        self.photo_sweep(cancel).await;

        self.stats.lock().await.last_sweep_completed = Some(Utc::now());
        info!("sync sweep completed");
        Ok(())
    }

    /// Channel discovery: one paginated listing pass.
    async fn discover_channels(&self) -> Result<Vec<crate::slack::provider::ProviderChannel>> {
        let mut all = Vec::new();
        let mut cursor = None;
        loop {
            let page = self
                .rate_limited(|| self.provider.list_channels(cursor.clone(), DISCOVERY_PAGE))
                .await?;
            all.extend(page.items);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(all)
    }

    /// Fetch info and members for one channel, upserting caches.
    async fn sync_channel(&self, channel_id: &str, cancel: &CancellationToken) -> Result<()> {
        let info = self
            .rate_limited(|| self.provider.channel_info(channel_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("channel {channel_id}")))?;

        let member_ids = self
            .rate_limited(|| {
                self.provider
                    .channel_members(channel_id, self.config.max_members_per_channel)
            })
            .await?;

        let mut users = Vec::new();
        for user_id in &member_ids {
            if cancel.is_cancelled() {
                break;
            }
            if self.caches.get_user(user_id).await?.is_some() {
                continue;
            }
            match self.rate_limited(|| self.provider.get_user(user_id)).await {
                Ok(Some(user)) if !user.is_bot && !user.deleted => {
                    users.push(CachedUser {
                        user_id: user.id,
                        user_name: user.name,
                        display_name: user.display_name,
                        real_name: user.real_name,
                        email: user.email,
                        avatar_url: user.avatar_url,
                        updated_at: Utc::now(),
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(user_id, %err, "member fetch failed");
                    self.stats.lock().await.errors += 1;
                }
            }
        }

        if !users.is_empty() {
            self.caches.cache_users(&users).await?;
            self.stats.lock().await.users_cached += users.len() as u64;
        }

        self.caches
            .cache_channels(&[CachedChannel {
                channel_id: info.id,
                name: info.name,
                purpose: info.purpose,
                topic: info.topic,
                member_count: info.member_count,
                updated_at: Utc::now(),
            }])
            .await?;
        Ok(())
    }

    /// Refresh the group cache in one call.
    async fn sync_groups(&self) {
        match self.rate_limited(|| self.provider.user_groups()).await {
            Ok(groups) => {
                let cached: Vec<CachedGroup> = groups
                    .into_iter()
                    .map(|g| CachedGroup {
                        group_id: g.id,
                        handle: g.handle,
                        name: g.name,
                        members: g.members,
                        updated_at: Utc::now(),
                    })
                    .collect();
                if let Err(err) = self.caches.cache_groups(&cached).await {
                    warn!(%err, "group cache upsert failed");
                    self.stats.lock().await.errors += 1;
                }
            }
            Err(err) => {
                warn!(%err, "group fetch failed");
                self.stats.lock().await.errors += 1;
            }
        }
    }

    /// Download missing avatar photos (write-then-rename).
    async fn photo_sweep(&self, cancel: &CancellationToken) {
        let users = match self.caches.users_with_avatars().await {
            Ok(users) => users,
            Err(err) => {
                warn!(%err, "photo sweep skipped; cache unreadable");
                return;
            }
        };

        if std::fs::create_dir_all(&self.photo_dir).is_err() {
            warn!(dir = %self.photo_dir.display(), "cannot create photo cache dir");
            return;
        }

        for user in users {
            if cancel.is_cancelled() {
                return;
            }
            let target = self.photo_dir.join(format!("{}.jpg", user.user_id));
            if target.exists() || self.seen_photos.lock().await.contains(&user.user_id) {
                continue;
            }

            match self.download_photo(&user.avatar_url, &target).await {
                Ok(()) => {
                    self.seen_photos.lock().await.insert(user.user_id.clone());
                    self.stats.lock().await.photos_downloaded += 1;
                }
                Err(AppError::RateLimited(secs)) => {
                    self.stats.lock().await.rate_limited += 1;
                    let wait = Duration::from_secs(secs.max(self.config.rate_limit_backoff_secs));
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(wait) => {}
                    }
                }
                Err(err) => {
                    debug!(user_id = %user.user_id, %err, "photo download failed");
                    self.stats.lock().await.photos_failed += 1;
                }
            }

            if self.pace(cancel).await {
                return;
            }
        }
    }

    async fn download_photo(&self, url: &str, target: &std::path::Path) -> Result<()> {
        let response = self
            .http
            .get(url)
            .timeout(PHOTO_TIMEOUT)
            .send()
            .await
            .map_err(|err| AppError::Provider(format!("photo fetch failed: {err}")))?;

        if response.status().as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(self.config.rate_limit_backoff_secs);
            return Err(AppError::RateLimited(retry_after));
        }
        if !response.status().is_success() {
            return Err(AppError::Provider(format!(
                "photo fetch returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| AppError::Provider(format!("photo body read failed: {err}")))?;

        let parent = target
            .parent()
            .ok_or_else(|| AppError::Io("photo path has no parent".into()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|err| AppError::Io(format!("photo temp file failed: {err}")))?;
        std::io::Write::write_all(&mut tmp, &bytes)
            .map_err(|err| AppError::Io(format!("photo write failed: {err}")))?;
        tmp.persist(target)
            .map_err(|err| AppError::Io(format!("photo rename failed: {err}")))?;
        Ok(())
    }

    /// Run a provider call, absorbing one rate-limit round by waiting
    /// out the backoff and retrying once. The wait honours at least the
    /// reported retry-after and at least the configured backoff.
    async fn rate_limited<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match call().await {
            Err(AppError::RateLimited(secs)) => {
                self.stats.lock().await.rate_limited += 1;
                let wait = Duration::from_secs(secs.max(self.config.rate_limit_backoff_secs));
                info!(wait_secs = wait.as_secs(), "provider rate limited; backing off");
                tokio::time::sleep(wait).await;
                call().await
            }
            other => other,
        }
    }

    /// Uniform random inter-item delay; returns `true` when cancelled.
    async fn pace(&self, cancel: &CancellationToken) -> bool {
        let delay = {
            let mut rng = rand::thread_rng();
            rng.gen_range(self.config.min_delay_secs..=self.config.max_delay_secs)
        };
        tokio::select! {
            () = cancel.cancelled() => true,
            () = tokio::time::sleep(Duration::from_secs_f64(delay)) => false,
        }
    }
}
