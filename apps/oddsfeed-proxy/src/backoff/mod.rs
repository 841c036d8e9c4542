//! Per-Entity Backoff Tracker
//!
//! Tracks consecutive fetch failures per polled entity and data kind.
//! While an entity is cooling down the publisher skips scheduling new
//! fetches for it. Success decrements the failure count by one instead
//! of resetting it, so recovery ramps back up smoothly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;

use crate::domain::channel::DataKind;

/// Backoff tracker configuration.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Maximum consecutive failures counted.
    pub max_attempts: u32,
    /// Jitter factor applied to each delay (0.2 = ±20%).
    pub jitter_factor: f64,
    /// Delay ceiling for odds entities.
    pub odds_cap: Duration,
    /// Delay ceiling for scorecard entities.
    pub scorecard_cap: Duration,
    /// Delay ceiling for fixture syncs.
    pub fixtures_cap: Duration,
}

impl BackoffConfig {
    /// Delay ceiling for the given kind.
    #[must_use]
    pub const fn cap_for(&self, kind: DataKind) -> Duration {
        match kind {
            DataKind::Odds => self.odds_cap,
            DataKind::Scorecard => self.scorecard_cap,
            DataKind::Fixtures => self.fixtures_cap,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_attempts: 8,
            jitter_factor: 0.2,
            odds_cap: Duration::from_secs(60),
            scorecard_cap: Duration::from_secs(300),
            fixtures_cap: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
struct EntityState {
    attempts: u32,
    cooldown_until: Instant,
}

/// Failure state per (entity, kind) pair.
///
/// A failing scorecard fetch never throttles odds fetches for the same
/// match; the pairs are independent.
#[derive(Debug)]
pub struct BackoffTracker {
    config: BackoffConfig,
    states: RwLock<HashMap<(String, DataKind), EntityState>>,
}

impl BackoffTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Whether fetches for this entity should be skipped right now.
    #[must_use]
    pub fn should_skip(&self, entity_id: &str, kind: DataKind) -> bool {
        self.states
            .read()
            .get(&(entity_id.to_string(), kind))
            .is_some_and(|state| Instant::now() < state.cooldown_until)
    }

    /// Record a failed fetch and start (or extend) the cooldown.
    ///
    /// Returns the cooldown applied.
    pub fn register_failure(&self, entity_id: &str, kind: DataKind) -> Duration {
        let mut states = self.states.write();
        let state = states
            .entry((entity_id.to_string(), kind))
            .or_insert(EntityState {
                attempts: 0,
                cooldown_until: Instant::now(),
            });

        state.attempts = (state.attempts + 1).min(self.config.max_attempts);
        let delay = self.delay_for(state.attempts, kind);
        state.cooldown_until = Instant::now() + delay;

        tracing::debug!(
            entity = entity_id,
            kind = %kind,
            attempts = state.attempts,
            cooldown_ms = delay.as_millis() as u64,
            "Entity backoff extended"
        );
        delay
    }

    /// Record a successful fetch.
    ///
    /// Decrements the failure count by one; the state is removed once
    /// it reaches zero.
    pub fn register_success(&self, entity_id: &str, kind: DataKind) {
        let key = (entity_id.to_string(), kind);
        let mut states = self.states.write();
        if let Some(state) = states.get_mut(&key) {
            state.attempts = state.attempts.saturating_sub(1);
            if state.attempts == 0 {
                states.remove(&key);
            } else {
                // Recovering entities poll again immediately.
                state.cooldown_until = Instant::now();
            }
        }
    }

    /// Recorded consecutive failures for an entity, zero when clean.
    #[must_use]
    pub fn attempts(&self, entity_id: &str, kind: DataKind) -> u32 {
        self.states
            .read()
            .get(&(entity_id.to_string(), kind))
            .map_or(0, |state| state.attempts)
    }

    /// Counter snapshot for diagnostics.
    #[must_use]
    pub fn stats(&self) -> BackoffStats {
        let states = self.states.read();
        let now = Instant::now();
        BackoffStats {
            tracked_entities: states.len(),
            cooling_down: states
                .values()
                .filter(|state| now < state.cooldown_until)
                .count(),
        }
    }

    /// min(base * 2^(attempts - 1), kind cap), with jitter.
    fn delay_for(&self, attempts: u32, kind: DataKind) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let base_ms = self.config.base_delay.as_millis() as u64;
        let raw_ms = base_ms.saturating_mul(1u64 << exponent);
        let capped_ms = raw_ms.min(self.config.cap_for(kind).as_millis() as u64);

        let jitter = self.config.jitter_factor;
        if jitter <= f64::EPSILON {
            return Duration::from_millis(capped_ms);
        }
        let mut rng = rand::rng();
        let factor = rng.random_range(1.0 - jitter..=1.0 + jitter);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let jittered_ms = (capped_ms as f64 * factor).max(0.0) as u64;
        Duration::from_millis(jittered_ms)
    }
}

/// Snapshot of the backoff tracker.
#[derive(Debug, Clone, Serialize)]
pub struct BackoffStats {
    /// (entity, kind) pairs currently tracked.
    pub tracked_entities: usize,
    /// Pairs still inside their cooldown.
    pub cooling_down: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter_config() -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(10),
            max_attempts: 5,
            jitter_factor: 0.0,
            odds_cap: Duration::from_millis(80),
            scorecard_cap: Duration::from_millis(160),
            fixtures_cap: Duration::from_millis(320),
        }
    }

    #[test]
    fn clean_entity_is_never_skipped() {
        let tracker = BackoffTracker::new(no_jitter_config());
        assert!(!tracker.should_skip("match-1", DataKind::Odds));
        assert_eq!(tracker.attempts("match-1", DataKind::Odds), 0);
    }

    #[test]
    fn failure_starts_cooldown() {
        let tracker = BackoffTracker::new(no_jitter_config());
        let delay = tracker.register_failure("match-1", DataKind::Odds);
        assert_eq!(delay, Duration::from_millis(10));
        assert!(tracker.should_skip("match-1", DataKind::Odds));
    }

    #[test]
    fn delay_doubles_per_failure_up_to_kind_cap() {
        let tracker = BackoffTracker::new(no_jitter_config());
        // 10, 20, 40, 80, then capped at the odds ceiling of 80.
        assert_eq!(
            tracker.register_failure("match-1", DataKind::Odds),
            Duration::from_millis(10)
        );
        assert_eq!(
            tracker.register_failure("match-1", DataKind::Odds),
            Duration::from_millis(20)
        );
        assert_eq!(
            tracker.register_failure("match-1", DataKind::Odds),
            Duration::from_millis(40)
        );
        assert_eq!(
            tracker.register_failure("match-1", DataKind::Odds),
            Duration::from_millis(80)
        );
        assert_eq!(
            tracker.register_failure("match-1", DataKind::Odds),
            Duration::from_millis(80)
        );
    }

    #[test]
    fn attempts_are_capped() {
        let tracker = BackoffTracker::new(no_jitter_config());
        for _ in 0..10 {
            tracker.register_failure("match-1", DataKind::Odds);
        }
        assert_eq!(tracker.attempts("match-1", DataKind::Odds), 5);
    }

    #[test]
    fn success_decrements_by_one_not_to_zero() {
        let tracker = BackoffTracker::new(no_jitter_config());
        for _ in 0..3 {
            tracker.register_failure("match-1", DataKind::Scorecard);
        }
        tracker.register_success("match-1", DataKind::Scorecard);
        assert_eq!(tracker.attempts("match-1", DataKind::Scorecard), 2);
        // Cooldown lifts immediately on success.
        assert!(!tracker.should_skip("match-1", DataKind::Scorecard));
    }

    #[test]
    fn state_removed_once_attempts_reach_zero() {
        let tracker = BackoffTracker::new(no_jitter_config());
        tracker.register_failure("match-1", DataKind::Odds);
        tracker.register_success("match-1", DataKind::Odds);
        assert_eq!(tracker.stats().tracked_entities, 0);
    }

    #[test]
    fn kinds_are_tracked_independently() {
        let tracker = BackoffTracker::new(no_jitter_config());
        for _ in 0..3 {
            tracker.register_failure("match-1", DataKind::Scorecard);
        }
        assert!(tracker.should_skip("match-1", DataKind::Scorecard));
        assert!(!tracker.should_skip("match-1", DataKind::Odds));
    }

    #[test]
    fn cooldown_expires() {
        let tracker = BackoffTracker::new(no_jitter_config());
        tracker.register_failure("match-1", DataKind::Odds);
        assert!(tracker.should_skip("match-1", DataKind::Odds));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!tracker.should_skip("match-1", DataKind::Odds));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = BackoffConfig {
            jitter_factor: 0.2,
            ..no_jitter_config()
        };
        let tracker = BackoffTracker::new(config);
        for i in 0..100 {
            let entity = format!("match-{i}");
            let delay = tracker.register_failure(&entity, DataKind::Odds);
            assert!(
                delay >= Duration::from_millis(8) && delay <= Duration::from_millis(12),
                "delay {delay:?} outside ±20% of 10ms"
            );
        }
    }

    #[test]
    fn stats_count_cooling_entities() {
        let tracker = BackoffTracker::new(no_jitter_config());
        tracker.register_failure("match-1", DataKind::Odds);
        tracker.register_failure("match-2", DataKind::Odds);
        let stats = tracker.stats();
        assert_eq!(stats.tracked_entities, 2);
        assert_eq!(stats.cooling_down, 2);
    }
}
