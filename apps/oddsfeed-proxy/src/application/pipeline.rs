//! Pipeline Assembly
//!
//! Builds every runtime component from one [`ProxyConfig`] and wires
//! them together: admission guards the fetcher, the fetcher feeds the
//! cache, the publisher reads the cache and pushes through the hub,
//! and the job queue runs forced refreshes through the same path.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionSnapshot};
use crate::backoff::{BackoffStats, BackoffTracker};
use crate::cache::{CacheOptions, CacheStats, RefreshAheadCache};
use crate::delivery::{DeliveryHub, DeliveryStats, UpdateEvent};
use crate::domain::channel::Channel;
use crate::domain::subscription::{ConnectionId, SubscriptionRegistry, TotalSubscriptionStats};
use crate::fetch::{FetchError, Fetcher};
use crate::infrastructure::config::ProxyConfig;
use crate::publisher::{FanOutPublisher, PublisherStats};
use crate::queue::{Job, JobHandler, JobQueue, JobType, QueueStats};
use crate::upstream::UpstreamProvider;

// =============================================================================
// Pipeline
// =============================================================================

/// The assembled distribution pipeline.
///
/// Owns every component behind `Arc` so background tasks and the
/// health endpoint can share them.
pub struct Pipeline {
    admission: Arc<AdmissionController>,
    fetcher: Arc<Fetcher>,
    cache: Arc<RefreshAheadCache>,
    queue: Arc<JobQueue>,
    backoff: Arc<BackoffTracker>,
    registry: Arc<SubscriptionRegistry>,
    hub: Arc<DeliveryHub>,
    publisher: Arc<FanOutPublisher>,
    upstream: Arc<dyn UpstreamProvider>,
    connection_buffer: usize,
}

impl Pipeline {
    /// Build the full pipeline from configuration and an upstream.
    #[must_use]
    pub fn new(config: &ProxyConfig, upstream: Arc<dyn UpstreamProvider>) -> Self {
        let admission = Arc::new(AdmissionController::new(config.admission.clone()));
        let fetcher = Arc::new(Fetcher::new(
            Arc::clone(&admission),
            config.retry.clone(),
            config.request_timeout,
        ));
        let cache = Arc::new(RefreshAheadCache::new(config.cache.clone()));
        let queue = Arc::new(JobQueue::new(config.queue.clone()));
        let backoff = Arc::new(BackoffTracker::new(config.backoff.clone()));
        let registry = Arc::new(SubscriptionRegistry::new());
        let hub = Arc::new(DeliveryHub::new());
        let publisher = Arc::new(FanOutPublisher::new(
            config.publisher.clone(),
            Arc::clone(&registry),
            Arc::clone(&backoff),
            Arc::clone(&cache),
            Arc::clone(&fetcher),
            Arc::clone(&upstream),
            Arc::clone(&hub),
        ));

        Self {
            admission,
            fetcher,
            cache,
            queue,
            backoff,
            registry,
            hub,
            publisher,
            upstream,
            connection_buffer: config.connection_buffer,
        }
    }

    /// Start the publisher tick loops and the queue dispatchers.
    ///
    /// All spawned tasks stop when `cancel` fires.
    pub fn start(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let handler: Arc<dyn JobHandler> = Arc::new(RefreshJobHandler {
            cache: Arc::clone(&self.cache),
            fetcher: Arc::clone(&self.fetcher),
            upstream: Arc::clone(&self.upstream),
        });

        let mut tasks = self.publisher.run(cancel.clone());
        tasks.extend(self.queue.run_workers(handler, cancel.clone()));
        tasks
    }

    /// Register a new downstream connection.
    ///
    /// The receiver half carries every update published to channels
    /// the connection subscribes to.
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<UpdateEvent>) {
        self.hub.register(self.connection_buffer)
    }

    /// Tear down a connection and all of its subscriptions.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        self.hub.unregister(connection_id);
        let dropped = self.registry.connection_closed(connection_id);
        if !dropped.is_empty() {
            tracing::debug!(
                connection_id,
                channels = dropped.len(),
                "Subscriptions dropped on disconnect"
            );
        }
    }

    /// Subscribe a connection to a channel.
    ///
    /// Returns `false` when the subscription already existed.
    pub fn subscribe(&self, connection_id: ConnectionId, channel: &Channel) -> bool {
        self.registry.subscribe(connection_id, channel)
    }

    /// Remove one subscription.
    pub fn unsubscribe(&self, connection_id: ConnectionId, channel: &Channel) -> bool {
        self.registry.unsubscribe(connection_id, channel)
    }

    /// Queue a forced refresh outside the regular tick schedule.
    pub fn schedule_refresh(&self, job_type: JobType, payload: Value, priority: u8) -> Uuid {
        self.queue.enqueue(job_type, payload, priority)
    }

    /// The admission controller shared by every fetch.
    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// The shared cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<RefreshAheadCache> {
        &self.cache
    }

    /// The subscription registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// The delivery hub.
    #[must_use]
    pub fn hub(&self) -> &Arc<DeliveryHub> {
        &self.hub
    }

    /// The fan-out publisher.
    #[must_use]
    pub fn publisher(&self) -> &Arc<FanOutPublisher> {
        &self.publisher
    }

    /// The job queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// The per-entity backoff tracker.
    #[must_use]
    pub fn backoff(&self) -> &Arc<BackoffTracker> {
        &self.backoff
    }

    /// Snapshot every component for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            admission: self.admission.snapshot(),
            cache: self.cache.stats(),
            queue: self.queue.stats(),
            backoff: self.backoff.stats(),
            subscriptions: self.registry.total_stats(),
            delivery: self.hub.stats(),
            publisher: self.publisher.stats(),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("connections", &self.hub.connection_count())
            .field("connection_buffer", &self.connection_buffer)
            .finish_non_exhaustive()
    }
}

/// Snapshot of every pipeline component, serialized by the health
/// endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    /// Admission layer state.
    pub admission: AdmissionSnapshot,
    /// Cache counters.
    pub cache: CacheStats,
    /// Queue counters.
    pub queue: QueueStats,
    /// Backoff tracker counters.
    pub backoff: BackoffStats,
    /// Subscription counts per kind.
    pub subscriptions: TotalSubscriptionStats,
    /// Delivery hub counters.
    pub delivery: DeliveryStats,
    /// Publisher counters.
    pub publisher: PublisherStats,
}

// =============================================================================
// Job handler
// =============================================================================

/// Executes refresh jobs by forcing a fetch through the shared cache.
///
/// Jobs carry an optional `entity_id` in their payload; without one
/// the refresh targets the kind's global channel.
pub struct RefreshJobHandler {
    cache: Arc<RefreshAheadCache>,
    fetcher: Arc<Fetcher>,
    upstream: Arc<dyn UpstreamProvider>,
}

impl RefreshJobHandler {
    /// Wire a handler to the shared cache, fetcher, and upstream.
    #[must_use]
    pub fn new(
        cache: Arc<RefreshAheadCache>,
        fetcher: Arc<Fetcher>,
        upstream: Arc<dyn UpstreamProvider>,
    ) -> Self {
        Self {
            cache,
            fetcher,
            upstream,
        }
    }
}

#[async_trait]
impl JobHandler for RefreshJobHandler {
    async fn execute(&self, job: &Job) -> Result<(), FetchError> {
        let kind = job.job_type.data_kind();
        let entity = job
            .payload
            .get("entity_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let channel = entity.clone().map_or_else(
            || Channel::global(kind),
            |id| Channel::entity(kind, id),
        );

        let fetcher = Arc::clone(&self.fetcher);
        let upstream = Arc::clone(&self.upstream);

        self.cache
            .get(
                &channel.cache_key(),
                CacheOptions {
                    force_refresh: true,
                    ttl_override: Some(kind.default_ttl()),
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
            .map(|_| ())
    }
}

impl std::fmt::Debug for RefreshJobHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshJobHandler").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::domain::channel::DataKind;
    use crate::infrastructure::config::{Credentials, ProxyConfig, ServerSettings};

    struct CountingUpstream {
        calls: AtomicU32,
    }

    #[async_trait]
    impl UpstreamProvider for CountingUpstream {
        async fn fetch_entity(
            &self,
            kind: DataKind,
            entity_id: Option<&str>,
        ) -> Result<Value, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({
                "kind": kind.as_str(),
                "entity": entity_id,
                "call": call,
            }))
        }
    }

    fn test_config() -> ProxyConfig {
        ProxyConfig {
            credentials: Credentials::new("test-key".to_string()),
            upstream_base_url: "http://localhost:1".to_string(),
            request_timeout: Duration::from_secs(1),
            server: ServerSettings {
                health_port: 0,
                metrics_port: 0,
            },
            admission: crate::admission::AdmissionConfig::default(),
            retry: crate::fetch::RetryPolicy::default(),
            cache: crate::cache::CacheConfig::default(),
            queue: crate::queue::QueueConfig::default(),
            backoff: crate::backoff::BackoffConfig::default(),
            publisher: crate::publisher::PublisherConfig::default(),
            connection_buffer: 16,
        }
    }

    fn test_pipeline() -> (Pipeline, Arc<CountingUpstream>) {
        let upstream = Arc::new(CountingUpstream {
            calls: AtomicU32::new(0),
        });
        let pipeline = Pipeline::new(&test_config(), Arc::clone(&upstream) as Arc<dyn UpstreamProvider>);
        (pipeline, upstream)
    }

    #[tokio::test]
    async fn connect_subscribe_disconnect_round_trip() {
        let (pipeline, _) = test_pipeline();

        let (conn, _rx) = pipeline.connect();
        let channel = Channel::entity(DataKind::Odds, "match-1");
        assert!(pipeline.subscribe(conn, &channel));
        assert!(!pipeline.subscribe(conn, &channel));

        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.delivery.connections, 1);
        assert_eq!(snapshot.subscriptions.odds.channel_count, 1);

        pipeline.disconnect(conn);
        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.delivery.connections, 0);
        assert_eq!(snapshot.subscriptions.odds.channel_count, 0);
    }

    #[tokio::test]
    async fn refresh_handler_populates_the_cache() {
        let (pipeline, upstream) = test_pipeline();
        let handler = RefreshJobHandler::new(
            Arc::clone(pipeline.cache()),
            Arc::new(Fetcher::new(
                Arc::clone(pipeline.admission()),
                crate::fetch::RetryPolicy::default(),
                Duration::from_secs(1),
            )),
            Arc::clone(&upstream) as Arc<dyn UpstreamProvider>,
        );

        let job = Job {
            id: Uuid::new_v4(),
            job_type: JobType::ScorecardRefresh,
            payload: json!({ "entity_id": "match-9" }),
            priority: 5,
            attempts: 0,
            max_attempts: 3,
            not_before: tokio::time::Instant::now(),
            enqueued_at: chrono::Utc::now(),
        };

        handler.execute(&job).await.unwrap();
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.cache().len(), 1);
    }

    #[tokio::test]
    async fn refresh_handler_without_entity_targets_the_global_channel() {
        let (pipeline, upstream) = test_pipeline();
        let handler = RefreshJobHandler::new(
            Arc::clone(pipeline.cache()),
            Arc::new(Fetcher::new(
                Arc::clone(pipeline.admission()),
                crate::fetch::RetryPolicy::default(),
                Duration::from_secs(1),
            )),
            Arc::clone(&upstream) as Arc<dyn UpstreamProvider>,
        );

        let job = Job {
            id: Uuid::new_v4(),
            job_type: JobType::FixtureSync,
            payload: json!({}),
            priority: 5,
            attempts: 0,
            max_attempts: 3,
            not_before: tokio::time::Instant::now(),
            enqueued_at: chrono::Utc::now(),
        };

        handler.execute(&job).await.unwrap();
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        let cached = pipeline
            .cache()
            .get(
                &Channel::global(DataKind::Fixtures).cache_key(),
                CacheOptions::default(),
                || async { Err(FetchError::Malformed("cache should hit".to_string())) },
            )
            .await
            .unwrap();
        assert_eq!(cached.payload["entity"], Value::Null);
    }

    #[tokio::test]
    async fn started_pipeline_executes_queued_jobs() {
        let (pipeline, upstream) = test_pipeline();
        let cancel = CancellationToken::new();
        let tasks = pipeline.start(&cancel);

        pipeline.schedule_refresh(
            JobType::OddsRefresh,
            json!({ "entity_id": "match-3" }),
            8,
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while upstream.calls.load(Ordering::SeqCst) == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "job never reached the upstream"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }

        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.queue.completed_total, 1);
    }
}
