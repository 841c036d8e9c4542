//! Circuit Breaker
//!
//! Prevents calls to a consistently failing upstream provider.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN (>= failure_threshold failures inside monitoring_window)
//! OPEN → HALF_OPEN (reset_timeout elapsed)
//! HALF_OPEN → CLOSED (success_threshold consecutive successes)
//! HALF_OPEN → OPEN (any failure)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without being attempted.
    Open,
    /// Probing with live calls after the open period.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failures inside the monitoring window that open the circuit.
    pub failure_threshold: u32,
    /// Sliding time window over which failures are counted.
    pub monitoring_window: Duration,
    /// How long the circuit stays open before probing.
    pub reset_timeout: Duration,
    /// Consecutive successes in half-open required to close.
    pub success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            monitoring_window: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(10),
            success_threshold: 3,
        }
    }
}

/// Three-state guard around one upstream service.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Resource name for logging.
    name: String,
    config: CircuitConfig,
    state: RwLock<CircuitState>,
    /// Timestamps of recent failures, pruned to the monitoring window.
    failures: RwLock<VecDeque<Instant>>,
    /// When the circuit opened.
    opened_at: RwLock<Option<Instant>>,
    /// Consecutive successes while half-open.
    half_open_successes: AtomicU32,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    state_transitions: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new breaker in the closed state.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            failures: RwLock::new(VecDeque::new()),
            opened_at: RwLock::new(None),
            half_open_successes: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
        }
    }

    /// Resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying any pending time-based transition.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.check_reset_timeout();
        *self.state.read()
    }

    /// Whether a call may proceed right now.
    #[must_use]
    pub fn is_call_permitted(&self) -> bool {
        self.check_reset_timeout();
        match *self.state.read() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                self.prune_failures();
            }
            CircuitState::HalfOpen => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to_closed();
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                let count = {
                    let mut failures = self.failures.write();
                    failures.push_back(Instant::now());
                    Self::prune(&mut failures, self.config.monitoring_window);
                    failures.len()
                };
                if count >= self.config.failure_threshold as usize {
                    self.transition_to_open();
                }
            }
            // Any failure while probing reopens immediately.
            CircuitState::HalfOpen => self.transition_to_open(),
            CircuitState::Open => {}
        }
    }

    /// Force the circuit open (operational override).
    pub fn force_open(&self) {
        self.transition_to_open();
    }

    /// Force the circuit closed (operational override).
    pub fn force_close(&self) {
        self.transition_to_closed();
    }

    /// Snapshot for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            name: self.name.clone(),
            state: self.state(),
            recent_failures: self.failures.read().len(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
        }
    }

    fn prune_failures(&self) {
        let mut failures = self.failures.write();
        Self::prune(&mut failures, self.config.monitoring_window);
    }

    fn prune(failures: &mut VecDeque<Instant>, window: Duration) {
        let now = Instant::now();
        while let Some(front) = failures.front() {
            if now.duration_since(*front) > window {
                failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn check_reset_timeout(&self) {
        let state = *self.state.read();
        if state == CircuitState::Open
            && let Some(opened) = *self.opened_at.read()
            && opened.elapsed() >= self.config.reset_timeout
        {
            self.transition_to_half_open();
        }
    }

    fn transition_to_open(&self) {
        let mut state = self.state.write();
        let previous = *state;
        if previous != CircuitState::Open {
            *state = CircuitState::Open;
            drop(state);

            *self.opened_at.write() = Some(Instant::now());
            self.state_transitions.fetch_add(1, Ordering::Relaxed);
            crate::infrastructure::metrics::record_circuit_opened(&self.name);

            tracing::warn!(
                name = %self.name,
                from = %previous,
                to = "OPEN",
                "Circuit breaker opened"
            );
        }
    }

    fn transition_to_half_open(&self) {
        let mut state = self.state.write();
        let previous = *state;
        if previous == CircuitState::Open {
            *state = CircuitState::HalfOpen;
            drop(state);

            self.half_open_successes.store(0, Ordering::Relaxed);
            self.state_transitions.fetch_add(1, Ordering::Relaxed);

            tracing::info!(
                name = %self.name,
                from = %previous,
                to = "HALF_OPEN",
                "Circuit breaker probing"
            );
        }
    }

    fn transition_to_closed(&self) {
        let mut state = self.state.write();
        let previous = *state;
        if previous != CircuitState::Closed {
            *state = CircuitState::Closed;
            drop(state);

            self.failures.write().clear();
            *self.opened_at.write() = None;
            self.half_open_successes.store(0, Ordering::Relaxed);
            self.state_transitions.fetch_add(1, Ordering::Relaxed);

            tracing::info!(
                name = %self.name,
                from = %previous,
                to = "CLOSED",
                "Circuit breaker closed"
            );
        }
    }
}

/// Diagnostic snapshot of a circuit breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Resource name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures still inside the monitoring window.
    pub recent_failures: usize,
    /// Total calls recorded.
    pub total_calls: u64,
    /// Total failures recorded.
    pub total_failures: u64,
    /// State transitions since creation.
    pub state_transitions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            monitoring_window: Duration::from_secs(10),
            reset_timeout: Duration::from_millis(20),
            success_threshold: 2,
        }
    }

    #[test]
    fn initial_state_is_closed() {
        let breaker = CircuitBreaker::new("odds", CircuitConfig::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.is_call_permitted());
    }

    #[test]
    fn opens_after_threshold_failures_in_window() {
        let breaker = CircuitBreaker::new("odds", fast_config());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_call_permitted());
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let config = CircuitConfig {
            failure_threshold: 2,
            monitoring_window: Duration::from_millis(10),
            ..fast_config()
        };
        let breaker = CircuitBreaker::new("odds", config);

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        breaker.record_failure();

        // First failure aged out of the window.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn open_transitions_to_half_open_after_reset_timeout() {
        let breaker = CircuitBreaker::new("odds", fast_config());

        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.is_call_permitted());
    }

    #[test]
    fn half_open_closes_after_consecutive_successes() {
        let breaker = CircuitBreaker::new("odds", fast_config());

        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_reopens_on_failure() {
        let breaker = CircuitBreaker::new("odds", fast_config());

        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn closing_clears_failure_window() {
        let breaker = CircuitBreaker::new("odds", fast_config());

        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(30));
        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);

        // A single new failure must not trip the fresh window.
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn force_open_and_close() {
        let breaker = CircuitBreaker::new("odds", CircuitConfig::default());

        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.force_close();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn snapshot_counts_calls() {
        let breaker = CircuitBreaker::new("odds", fast_config());

        breaker.record_success();
        breaker.record_failure();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.name, "odds");
        assert_eq!(snapshot.total_calls, 2);
        assert_eq!(snapshot.total_failures, 1);
        assert_eq!(snapshot.recent_failures, 1);
    }
}
