//! Fan-Out Pipeline Integration Tests
//!
//! Exercises the assembled pipeline end to end: subscribe, tick, and
//! observe what reaches the downstream connection.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use oddsfeed_proxy::{
    AdmissionConfig, CacheConfig, Channel, Credentials, DataKind, FetchError, Pipeline,
    ProxyConfig, PublisherConfig, RetryPolicy, ServerSettings, UpstreamProvider,
};

/// Upstream that replays a scripted response sequence, then repeats
/// the last entry.
struct ScriptedUpstream {
    responses: Vec<Result<Value, u16>>,
    calls: AtomicUsize,
}

impl ScriptedUpstream {
    fn new(responses: Vec<Result<Value, u16>>) -> Arc<Self> {
        Arc::new(Self {
            responses,
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamProvider for ScriptedUpstream {
    async fn fetch_entity(
        &self,
        _kind: DataKind,
        _entity_id: Option<&str>,
    ) -> Result<Value, FetchError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .responses
            .get(index.min(self.responses.len().saturating_sub(1)))
            .cloned()
            .unwrap_or(Err(500));
        scripted.map_err(|status| FetchError::Upstream {
            status,
            message: "scripted failure".into(),
        })
    }
}

/// Configuration tuned so every tick reaches the scripted upstream.
fn fast_config() -> ProxyConfig {
    ProxyConfig {
        credentials: Credentials::new("test-key".to_string()),
        upstream_base_url: "http://localhost:1".to_string(),
        request_timeout: Duration::from_secs(1),
        server: ServerSettings {
            health_port: 0,
            metrics_port: 0,
        },
        admission: AdmissionConfig::default(),
        retry: RetryPolicy {
            max_attempts: 1,
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        },
        cache: CacheConfig {
            default_ttl: Duration::from_millis(1),
            refresh_threshold: 0.0,
            update_channel_capacity: 16,
        },
        queue: oddsfeed_proxy::QueueConfig::default(),
        backoff: oddsfeed_proxy::BackoffConfig {
            base_delay: Duration::from_millis(50),
            jitter_factor: 0.0,
            ..oddsfeed_proxy::BackoffConfig::default()
        },
        publisher: PublisherConfig {
            odds_ttl: Duration::from_millis(1),
            scorecard_ttl: Duration::from_millis(1),
            fixtures_ttl: Duration::from_millis(1),
            ..PublisherConfig::default()
        },
        connection_buffer: 16,
    }
}

#[tokio::test]
async fn identical_payloads_reach_subscribers_once() {
    let upstream = ScriptedUpstream::new(vec![
        Ok(json!({"home": "2/1", "away": "3/1"})),
        Ok(json!({"home": "2/1", "away": "3/1"})),
        Ok(json!({"home": "5/2", "away": "3/1"})),
    ]);
    let pipeline = Arc::new(Pipeline::new(
        &fast_config(),
        Arc::clone(&upstream) as Arc<dyn UpstreamProvider>,
    ));

    let (conn, mut rx) = pipeline.connect();
    let channel = Channel::entity(DataKind::Odds, "match-7");
    assert!(pipeline.subscribe(conn, &channel));

    for _ in 0..3 {
        pipeline.publisher().tick(DataKind::Odds).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let first = rx.try_recv().expect("first update");
    assert_eq!(*first.payload, json!({"home": "2/1", "away": "3/1"}));
    let second = rx.try_recv().expect("changed update");
    assert_eq!(*second.payload, json!({"home": "5/2", "away": "3/1"}));
    assert!(rx.try_recv().is_err(), "duplicate payload must be suppressed");

    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.publisher.published, 2);
    assert_eq!(snapshot.publisher.suppressed, 1);
    assert_eq!(snapshot.delivery.delivered, 2);
}

#[tokio::test]
async fn upstream_failure_falls_back_to_the_cached_payload() {
    let upstream = ScriptedUpstream::new(vec![Ok(json!({"over": 1.85})), Err(500)]);
    let pipeline = Arc::new(Pipeline::new(
        &fast_config(),
        Arc::clone(&upstream) as Arc<dyn UpstreamProvider>,
    ));

    let (conn, mut rx) = pipeline.connect();
    let channel = Channel::entity(DataKind::Odds, "match-8");
    pipeline.subscribe(conn, &channel);

    pipeline.publisher().tick(DataKind::Odds).await;
    assert_eq!(*rx.try_recv().expect("initial update").payload, json!({"over": 1.85}));

    // Let the entry expire so the next tick actually refetches.
    tokio::time::sleep(Duration::from_millis(5)).await;
    pipeline.publisher().tick(DataKind::Odds).await;

    // The stale value stands in for the failed fetch: no new delivery,
    // no backoff, no fetch failure surfaced.
    assert!(rx.try_recv().is_err());
    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.publisher.fetch_failures, 0);
    assert_eq!(snapshot.publisher.suppressed, 1);
    assert_eq!(snapshot.backoff.cooling_down, 0);
    assert_eq!(snapshot.cache.stale_served, 1);
}

#[tokio::test]
async fn disconnect_stops_all_polling_for_the_channel() {
    let upstream = ScriptedUpstream::new(vec![Ok(json!({"v": 1}))]);
    let pipeline = Arc::new(Pipeline::new(
        &fast_config(),
        Arc::clone(&upstream) as Arc<dyn UpstreamProvider>,
    ));

    let (conn, _rx) = pipeline.connect();
    let channel = Channel::entity(DataKind::Scorecard, "match-9");
    pipeline.subscribe(conn, &channel);

    pipeline.publisher().tick(DataKind::Scorecard).await;
    assert_eq!(upstream.call_count(), 1);

    pipeline.disconnect(conn);

    tokio::time::sleep(Duration::from_millis(5)).await;
    pipeline.publisher().tick(DataKind::Scorecard).await;
    assert_eq!(upstream.call_count(), 1, "nobody left to fetch for");

    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.subscriptions.scorecard.channel_count, 0);
    assert_eq!(snapshot.delivery.connections, 0);
}

#[tokio::test]
async fn two_subscribers_on_one_channel_share_a_single_fetch() {
    let upstream = ScriptedUpstream::new(vec![Ok(json!({"wickets": 3}))]);
    let pipeline = Arc::new(Pipeline::new(
        &fast_config(),
        Arc::clone(&upstream) as Arc<dyn UpstreamProvider>,
    ));

    let channel = Channel::entity(DataKind::Scorecard, "match-12");
    let (conn_a, mut rx_a) = pipeline.connect();
    let (conn_b, mut rx_b) = pipeline.connect();
    pipeline.subscribe(conn_a, &channel);
    pipeline.subscribe(conn_b, &channel);

    pipeline.publisher().tick(DataKind::Scorecard).await;

    assert_eq!(upstream.call_count(), 1);
    assert_eq!(*rx_a.try_recv().expect("update for a").payload, json!({"wickets": 3}));
    assert_eq!(*rx_b.try_recv().expect("update for b").payload, json!({"wickets": 3}));
}
