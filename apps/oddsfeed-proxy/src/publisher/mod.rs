//! Fan-Out Publisher
//!
//! The orchestration loop. One ticker per data kind enumerates the
//! channels somebody is subscribed to, skips entities in cooldown,
//! fetches through the refresh-ahead cache, and pushes to subscribers
//! only when the payload's content hash changed since the last push.
//! Fetch failures feed the backoff tracker and are never surfaced to
//! subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;

use crate::infrastructure::metrics::{
    record_fetch_attempt, record_fetch_duration, set_active_channels,
};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffTracker;
use crate::cache::{CacheOptions, CachedValue, Freshness, RefreshAheadCache};
use crate::delivery::{DeliveryHub, UpdateEvent};
use crate::domain::channel::{Channel, ChannelState, DataKind, content_hash};
use crate::domain::subscription::SubscriptionRegistry;
use crate::fetch::Fetcher;
use crate::upstream::UpstreamProvider;

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Tick cadence for odds channels.
    pub odds_tick: Duration,
    /// Tick cadence for scorecard channels.
    pub scorecard_tick: Duration,
    /// Tick cadence for fixture channels.
    pub fixtures_tick: Duration,
    /// Cache ttl for odds payloads.
    pub odds_ttl: Duration,
    /// Cache ttl for scorecard payloads.
    pub scorecard_ttl: Duration,
    /// Cache ttl for fixture payloads.
    pub fixtures_ttl: Duration,
}

impl PublisherConfig {
    /// Tick cadence for the given kind.
    #[must_use]
    pub const fn tick_for(&self, kind: DataKind) -> Duration {
        match kind {
            DataKind::Odds => self.odds_tick,
            DataKind::Scorecard => self.scorecard_tick,
            DataKind::Fixtures => self.fixtures_tick,
        }
    }

    /// Cache ttl for the given kind.
    #[must_use]
    pub const fn ttl_for(&self, kind: DataKind) -> Duration {
        match kind {
            DataKind::Odds => self.odds_ttl,
            DataKind::Scorecard => self.scorecard_ttl,
            DataKind::Fixtures => self.fixtures_ttl,
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            odds_tick: DataKind::Odds.default_tick(),
            scorecard_tick: DataKind::Scorecard.default_tick(),
            fixtures_tick: DataKind::Fixtures.default_tick(),
            odds_ttl: DataKind::Odds.default_ttl(),
            scorecard_ttl: DataKind::Scorecard.default_ttl(),
            fixtures_ttl: DataKind::Fixtures.default_ttl(),
        }
    }
}

/// Subscriber-aware, deduplicating fan-out loop.
pub struct FanOutPublisher {
    config: PublisherConfig,
    registry: Arc<SubscriptionRegistry>,
    backoff: Arc<BackoffTracker>,
    cache: Arc<RefreshAheadCache>,
    fetcher: Arc<Fetcher>,
    upstream: Arc<dyn UpstreamProvider>,
    hub: Arc<DeliveryHub>,
    /// Last-delivered hash and timestamps, updated only after a push.
    states: RwLock<HashMap<Channel, ChannelState>>,
    published: AtomicU64,
    suppressed: AtomicU64,
    skipped_backoff: AtomicU64,
    fetch_failures: AtomicU64,
}

impl FanOutPublisher {
    /// Wire the publisher to its collaborators.
    #[must_use]
    pub fn new(
        config: PublisherConfig,
        registry: Arc<SubscriptionRegistry>,
        backoff: Arc<BackoffTracker>,
        cache: Arc<RefreshAheadCache>,
        fetcher: Arc<Fetcher>,
        upstream: Arc<dyn UpstreamProvider>,
        hub: Arc<DeliveryHub>,
    ) -> Self {
        Self {
            config,
            registry,
            backoff,
            cache,
            fetcher,
            upstream,
            hub,
            states: RwLock::new(HashMap::new()),
            published: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            skipped_backoff: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
        }
    }

    /// Start one tick loop per data kind.
    pub fn run(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        DataKind::all()
            .iter()
            .map(|&kind| {
                let publisher = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(publisher.config.tick_for(kind));
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    tracing::info!(kind = %kind, "Publisher tick loop started");
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            _ = interval.tick() => publisher.tick(kind).await,
                        }
                    }
                    tracing::info!(kind = %kind, "Publisher tick loop stopped");
                })
            })
            .collect()
    }

    /// Run one tick for a kind: poll every active channel once.
    ///
    /// Channels are processed sequentially, so within a channel the
    /// delivery order follows fetch completion.
    #[allow(clippy::cast_precision_loss)]
    pub async fn tick(&self, kind: DataKind) {
        let channels = self.registry.active_channels(kind);
        self.prune_states(kind, &channels);
        set_active_channels(kind, channels.len() as f64);
        if channels.is_empty() {
            return;
        }

        for channel in channels {
            if self.backoff.should_skip(channel.backoff_entity(), kind) {
                self.skipped_backoff.fetch_add(1, Ordering::Relaxed);
                counter!("oddsfeed_publisher_skipped_backoff_total", "kind" => kind.as_str())
                    .increment(1);
                continue;
            }
            self.poll_channel(kind, &channel).await;
        }
    }

    async fn poll_channel(&self, kind: DataKind, channel: &Channel) {
        record_fetch_attempt(kind);
        let started = std::time::Instant::now();
        let outcome = self.fetch_payload(kind, channel).await;
        record_fetch_duration(kind, started.elapsed());
        match outcome {
            Ok(cached) => {
                // A stale or fallback serve means upstream actually
                // failed; only a fresh payload clears the cooldown.
                if cached.freshness == Freshness::Fresh {
                    self.backoff.register_success(channel.backoff_entity(), kind);
                }
                self.publish_if_changed(channel, &cached);
            }
            Err(error) => {
                self.fetch_failures.fetch_add(1, Ordering::Relaxed);
                counter!("oddsfeed_publisher_fetch_failures_total", "kind" => kind.as_str())
                    .increment(1);
                let cooldown = self.backoff.register_failure(channel.backoff_entity(), kind);
                tracing::warn!(
                    channel = %channel,
                    error = %error,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "Channel fetch failed, entity cooling down"
                );
            }
        }
    }

    async fn fetch_payload(
        &self,
        kind: DataKind,
        channel: &Channel,
    ) -> Result<CachedValue, crate::fetch::FetchError> {
        let fetcher = Arc::clone(&self.fetcher);
        let upstream = Arc::clone(&self.upstream);
        let entity = channel.entity_id().map(str::to_string);

        self.cache
            .get(
                &channel.cache_key(),
                CacheOptions {
                    force_refresh: false,
                    ttl_override: Some(self.config.ttl_for(kind)),
                },
                move || {
                    let fetcher = Arc::clone(&fetcher);
                    let upstream = Arc::clone(&upstream);
                    let entity = entity.clone();
                    async move {
                        fetcher
                            .fetch(kind.as_str(), move || {
                                let upstream = Arc::clone(&upstream);
                                let entity = entity.clone();
                                async move { upstream.fetch_entity(kind, entity.as_deref()).await }
                            })
                            .await
                    }
                },
            )
            .await
    }

    /// Push to subscribers when the content hash changed; update the
    /// channel state only after the push went out.
    fn publish_if_changed(&self, channel: &Channel, cached: &CachedValue) {
        let hash = content_hash(&cached.payload);

        let unchanged = self
            .states
            .read()
            .get(channel)
            .and_then(|state| state.last_hash.as_deref())
            .is_some_and(|last| last == hash);
        if unchanged {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            counter!("oddsfeed_publisher_suppressed_total", "kind" => channel.kind().as_str())
                .increment(1);
            return;
        }

        let targets = self.registry.subscribers(channel);
        if targets.is_empty() {
            // Everyone left while the fetch was in flight.
            return;
        }

        let event = UpdateEvent {
            channel: channel.clone(),
            payload: Arc::clone(&cached.payload),
            timestamp: Utc::now(),
        };
        let dead = self.hub.deliver(&targets, &event);
        for connection_id in dead {
            let _ = self.registry.connection_closed(connection_id);
        }

        let mut states = self.states.write();
        let state = states.entry(channel.clone()).or_default();
        state.last_hash = Some(hash);
        state.last_delivered_at = Some(event.timestamp);
        state.deliveries += 1;
        drop(states);

        self.published.fetch_add(1, Ordering::Relaxed);
        counter!("oddsfeed_publisher_published_total", "kind" => channel.kind().as_str())
            .increment(1);
        tracing::debug!(channel = %channel, targets = targets.len(), "Update published");
    }

    /// Drop delivery state for channels of this kind nobody watches.
    fn prune_states(&self, kind: DataKind, active: &[Channel]) {
        let mut states = self.states.write();
        states.retain(|channel, _| channel.kind() != kind || active.contains(channel));
    }

    /// Counter snapshot for diagnostics.
    #[must_use]
    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            tracked_channels: self.states.read().len(),
            published: self.published.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            skipped_backoff: self.skipped_backoff.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for FanOutPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutPublisher")
            .field("config", &self.config)
            .field("tracked_channels", &self.states.read().len())
            .finish_non_exhaustive()
    }
}

/// Snapshot of the publisher.
#[derive(Debug, Clone, Serialize)]
pub struct PublisherStats {
    /// Channels with delivery state.
    pub tracked_channels: usize,
    /// Updates pushed to at least one connection.
    pub published: u64,
    /// Ticks suppressed because the payload was unchanged.
    pub suppressed: u64,
    /// Ticks skipped because the entity was cooling down.
    pub skipped_backoff: u64,
    /// Ticks that ended in a fetch failure.
    pub fetch_failures: u64,
}
