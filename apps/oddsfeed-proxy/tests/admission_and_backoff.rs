//! Admission and Backoff Integration Tests
//!
//! Covers the rate budget guarantees, circuit breaker transitions, and
//! the per-entity cooldown schedule.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

use std::time::Duration;

use proptest::prelude::*;
use test_case::test_case;

use oddsfeed_proxy::admission::AdmissionDenied;
use oddsfeed_proxy::{
    AdmissionConfig, AdmissionController, BackoffConfig, BackoffTracker, CircuitBreaker,
    CircuitConfig, CircuitState, DataKind, RateBudget, TokenBucket,
};

fn no_refill_admission(per_resource: u32, global: u32) -> AdmissionController {
    AdmissionController::new(AdmissionConfig {
        per_resource: RateBudget::new(per_resource, 0.0),
        global: RateBudget::new(global, 0.0),
        ..AdmissionConfig::default()
    })
}

fn no_jitter_backoff(base_ms: u64) -> BackoffTracker {
    BackoffTracker::new(BackoffConfig {
        base_delay: Duration::from_millis(base_ms),
        jitter_factor: 0.0,
        ..BackoffConfig::default()
    })
}

// =============================================================================
// Rate budgets
// =============================================================================

#[test]
fn burst_of_fifteen_admits_exactly_ten() {
    let controller = no_refill_admission(10, 100);

    let admitted = (0..15)
        .filter(|_| controller.try_acquire("odds", 1).is_ok())
        .count();

    assert_eq!(admitted, 10);
    assert!(matches!(
        controller.try_acquire("odds", 1),
        Err(AdmissionDenied::ResourceBudget)
    ));
}

#[test]
fn global_budget_caps_the_sum_across_resources() {
    let controller = no_refill_admission(10, 12);

    let odds = (0..10).filter(|_| controller.try_acquire("odds", 1).is_ok()).count();
    let fixtures = (0..10)
        .filter(|_| controller.try_acquire("fixtures", 1).is_ok())
        .count();

    assert_eq!(odds, 10);
    assert_eq!(fixtures, 2);
    assert!(matches!(
        controller.try_acquire("fixtures", 1),
        Err(AdmissionDenied::GlobalBudget)
    ));
}

#[test]
fn denied_requests_leave_the_budget_intact() {
    let controller = no_refill_admission(10, 5);

    // The global budget runs out first; the resource bucket must not
    // lose tokens on those denials.
    let admitted = (0..10).filter(|_| controller.try_acquire("odds", 1).is_ok()).count();
    assert_eq!(admitted, 5);

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.resources[0].tokens_available, 5.0);
    assert_eq!(snapshot.global_tokens_available, 0.0);
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[tokio::test]
async fn breaker_walks_closed_open_half_open_closed() {
    let breaker = CircuitBreaker::new(
        "odds",
        CircuitConfig {
            failure_threshold: 2,
            monitoring_window: Duration::from_secs(10),
            reset_timeout: Duration::from_millis(30),
            success_threshold: 1,
        },
    );

    assert_eq!(breaker.state(), CircuitState::Closed);
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.is_call_permitted());

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(breaker.is_call_permitted());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn half_open_failure_reopens_the_breaker() {
    let breaker = CircuitBreaker::new(
        "odds",
        CircuitConfig {
            failure_threshold: 1,
            monitoring_window: Duration::from_secs(10),
            reset_timeout: Duration::from_millis(30),
            success_threshold: 3,
        },
    );

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.is_call_permitted());
}

// =============================================================================
// Backoff schedule
// =============================================================================

#[test]
fn cooldown_doubles_per_failure_and_success_decrements_once() {
    let tracker = no_jitter_backoff(10);

    let mut delays = Vec::new();
    for _ in 0..5 {
        delays.push(tracker.register_failure("match-1", DataKind::Odds));
    }
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(80),
            Duration::from_millis(160),
        ]
    );
    assert!(tracker.should_skip("match-1", DataKind::Odds));

    // One success takes back exactly one failure and lifts the cooldown.
    tracker.register_success("match-1", DataKind::Odds);
    assert!(!tracker.should_skip("match-1", DataKind::Odds));
    assert_eq!(tracker.attempts("match-1", DataKind::Odds), 4);

    let next = tracker.register_failure("match-1", DataKind::Odds);
    assert_eq!(next, Duration::from_millis(160));
}

#[test]
fn repeated_successes_fully_clear_the_entity() {
    let tracker = no_jitter_backoff(10);

    tracker.register_failure("match-2", DataKind::Scorecard);
    tracker.register_failure("match-2", DataKind::Scorecard);

    tracker.register_success("match-2", DataKind::Scorecard);
    tracker.register_success("match-2", DataKind::Scorecard);

    assert_eq!(tracker.attempts("match-2", DataKind::Scorecard), 0);
    assert_eq!(tracker.stats().tracked_entities, 0);
}

#[test_case(DataKind::Odds, 60; "odds capped at one minute")]
#[test_case(DataKind::Scorecard, 300; "scorecards capped at five minutes")]
#[test_case(DataKind::Fixtures, 600; "fixtures capped at ten minutes")]
fn per_kind_delay_ceilings(kind: DataKind, cap_secs: u64) {
    let config = BackoffConfig::default();
    assert_eq!(config.cap_for(kind), Duration::from_secs(cap_secs));

    let tracker = BackoffTracker::new(BackoffConfig {
        jitter_factor: 0.0,
        ..config
    });
    let mut delay = Duration::ZERO;
    for _ in 0..30 {
        delay = tracker.register_failure("match-3", kind);
    }
    assert_eq!(delay, Duration::from_secs(cap_secs));
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn bucket_tokens_stay_within_bounds(requests in proptest::collection::vec(0u32..5, 1..60)) {
        let mut bucket = TokenBucket::new(RateBudget::new(10, 0.0));
        for n in requests {
            let before = bucket.available();
            let granted = bucket.try_acquire(n);
            let after = bucket.available();

            prop_assert!((0.0..=10.0).contains(&after));
            if granted {
                prop_assert!(before >= f64::from(n));
            } else {
                prop_assert!(after == before);
            }
        }
    }

    #[test]
    fn backoff_delay_never_exceeds_the_jittered_cap(failures in 1u32..40) {
        let config = BackoffConfig::default();
        let ceiling = config.odds_cap.mul_f64(1.0 + config.jitter_factor)
            + Duration::from_millis(1);
        let tracker = BackoffTracker::new(config);

        let mut delay = Duration::ZERO;
        for _ in 0..failures {
            delay = tracker.register_failure("match-4", DataKind::Odds);
        }
        prop_assert!(delay <= ceiling);
        prop_assert!(delay > Duration::ZERO);
    }
}
