//! Admission Control
//!
//! Gates every upstream call behind rate limiting and circuit breaking.
//! A call is admitted only when the per-resource token bucket, the
//! global token bucket, and the resource's circuit breaker all allow it.
//! Sustained 429 responses widen an adaptive delay that callers apply
//! before their next attempt.

pub mod bucket;
pub mod circuit;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

pub use bucket::{RateBudget, TokenBucket};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};

// ============================================================================
// Configuration
// ============================================================================

/// Admission control configuration.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Budget applied to each resource individually.
    pub per_resource: RateBudget,
    /// Budget shared across all resources.
    pub global: RateBudget,
    /// Circuit breaker settings applied per resource.
    pub circuit: CircuitConfig,
    /// Starting adaptive delay after the first rate-limit response.
    pub adaptive_delay_initial: Duration,
    /// Ceiling for the adaptive delay.
    pub adaptive_delay_max: Duration,
    /// How long `acquire_or_wait` polls before giving up.
    pub acquire_timeout: Duration,
    /// Poll interval used by `acquire_or_wait`.
    pub acquire_poll_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            per_resource: RateBudget::new(10, 10.0),
            global: RateBudget::new(50, 50.0),
            circuit: CircuitConfig::default(),
            adaptive_delay_initial: Duration::from_millis(500),
            adaptive_delay_max: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
            acquire_poll_interval: Duration::from_millis(50),
        }
    }
}

// ============================================================================
// Admission decision
// ============================================================================

/// Why a call was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDenied {
    /// The per-resource token bucket is empty.
    ResourceBudget,
    /// The shared global token bucket is empty.
    GlobalBudget,
    /// The resource's circuit breaker is open.
    CircuitOpen,
}

impl std::fmt::Display for AdmissionDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResourceBudget => write!(f, "resource budget exhausted"),
            Self::GlobalBudget => write!(f, "global budget exhausted"),
            Self::CircuitOpen => write!(f, "circuit open"),
        }
    }
}

// ============================================================================
// Per-resource state
// ============================================================================

#[derive(Debug)]
struct ResourceState {
    bucket: Mutex<TokenBucket>,
    breaker: CircuitBreaker,
    /// Current adaptive delay. Zero when the resource is healthy.
    adaptive_delay: RwLock<Duration>,
}

impl ResourceState {
    fn new(name: &str, config: &AdmissionConfig) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(config.per_resource)),
            breaker: CircuitBreaker::new(name, config.circuit.clone()),
            adaptive_delay: RwLock::new(Duration::ZERO),
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Combined rate limiter and circuit breaker front for upstream calls.
///
/// One instance is shared by all fetch paths. Resources are identified
/// by caller-chosen keys such as `"odds"` or `"scorecard"`.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    global_bucket: Mutex<TokenBucket>,
    resources: RwLock<HashMap<String, Arc<ResourceState>>>,
}

impl AdmissionController {
    /// Create a controller with the given configuration.
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        let global_bucket = Mutex::new(TokenBucket::new(config.global));
        Self {
            config,
            global_bucket,
            resources: RwLock::new(HashMap::new()),
        }
    }

    fn resource(&self, key: &str) -> Arc<ResourceState> {
        if let Some(state) = self.resources.read().get(key) {
            return Arc::clone(state);
        }
        let mut resources = self.resources.write();
        Arc::clone(
            resources
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(ResourceState::new(key, &self.config))),
        )
    }

    /// Attempt to admit `tokens` worth of work for `resource_key`
    /// without waiting. Most callers pass 1.
    ///
    /// Checks the circuit breaker first, then the per-resource bucket,
    /// then the global bucket. Tokens are only consumed when all three
    /// checks pass, so a denial never burns budget.
    ///
    /// # Errors
    ///
    /// Returns the first gate that refused the call.
    pub fn try_acquire(&self, resource_key: &str, tokens: u32) -> Result<(), AdmissionDenied> {
        let state = self.resource(resource_key);

        if !state.breaker.is_call_permitted() {
            return Err(AdmissionDenied::CircuitOpen);
        }

        // Hold both bucket locks so the pair of draws is atomic.
        let mut resource_bucket = state.bucket.lock();
        let mut global_bucket = self.global_bucket.lock();

        let needed = f64::from(tokens);
        if resource_bucket.available() < needed {
            return Err(AdmissionDenied::ResourceBudget);
        }
        if global_bucket.available() < needed {
            return Err(AdmissionDenied::GlobalBudget);
        }

        resource_bucket.try_acquire(tokens);
        global_bucket.try_acquire(tokens);
        Ok(())
    }

    /// Admit `tokens` worth of work, polling until capacity frees up or
    /// the wait bound elapses. `max_wait` of `None` uses the configured
    /// acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns the last denial reason when the wait bound expires. An
    /// open circuit is returned immediately; waiting cannot help it.
    pub async fn acquire_or_wait(
        &self,
        resource_key: &str,
        tokens: u32,
        max_wait: Option<Duration>,
    ) -> Result<(), AdmissionDenied> {
        let wait = max_wait.unwrap_or(self.config.acquire_timeout);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match self.try_acquire(resource_key, tokens) {
                Ok(()) => return Ok(()),
                Err(AdmissionDenied::CircuitOpen) => return Err(AdmissionDenied::CircuitOpen),
                Err(denied) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(denied);
                    }
                    tokio::time::sleep(self.config.acquire_poll_interval).await;
                }
            }
        }
    }

    /// Record a successful upstream call.
    ///
    /// Feeds the circuit breaker and halves the adaptive delay.
    pub fn record_success(&self, resource_key: &str) {
        let state = self.resource(resource_key);
        state.breaker.record_success();

        let mut delay = state.adaptive_delay.write();
        if !delay.is_zero() {
            *delay /= 2;
            if *delay < self.config.adaptive_delay_initial {
                *delay = Duration::ZERO;
            }
        }
    }

    /// Record a failed upstream call.
    pub fn record_failure(&self, resource_key: &str) {
        self.resource(resource_key).breaker.record_failure();
    }

    /// Record an upstream rate-limit (429) response.
    ///
    /// Counts as a failure for the circuit breaker and doubles the
    /// adaptive delay up to the configured ceiling.
    pub fn record_rate_limited(&self, resource_key: &str) {
        let state = self.resource(resource_key);
        state.breaker.record_failure();
        crate::infrastructure::metrics::record_rate_limited(resource_key);

        let mut delay = state.adaptive_delay.write();
        *delay = if delay.is_zero() {
            self.config.adaptive_delay_initial
        } else {
            (*delay * 2).min(self.config.adaptive_delay_max)
        };

        tracing::warn!(
            resource = resource_key,
            delay_ms = delay.as_millis() as u64,
            "Upstream rate limit, widening adaptive delay"
        );
    }

    /// Current adaptive delay for a resource. Zero when healthy.
    #[must_use]
    pub fn adaptive_delay(&self, resource_key: &str) -> Duration {
        *self.resource(resource_key).adaptive_delay.read()
    }

    /// Circuit state for a resource.
    #[must_use]
    pub fn circuit_state(&self, resource_key: &str) -> CircuitState {
        self.resource(resource_key).breaker.state()
    }

    /// Diagnostic snapshot across all known resources.
    #[must_use]
    pub fn snapshot(&self) -> AdmissionSnapshot {
        let resources = self.resources.read();
        let mut entries: Vec<ResourceSnapshot> = resources
            .iter()
            .map(|(key, state)| ResourceSnapshot {
                resource: key.clone(),
                tokens_available: state.bucket.lock().available(),
                adaptive_delay_ms: state.adaptive_delay.read().as_millis() as u64,
                circuit: state.breaker.snapshot(),
            })
            .collect();
        entries.sort_by(|a, b| a.resource.cmp(&b.resource));

        AdmissionSnapshot {
            global_tokens_available: self.global_bucket.lock().available(),
            resources: entries,
        }
    }
}

/// Diagnostic snapshot of one admitted resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    /// Resource key.
    pub resource: String,
    /// Tokens currently available in the resource bucket.
    pub tokens_available: f64,
    /// Adaptive delay in milliseconds.
    pub adaptive_delay_ms: u64,
    /// Circuit breaker snapshot.
    pub circuit: CircuitSnapshot,
}

/// Diagnostic snapshot of the whole admission layer.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    /// Tokens currently available in the global bucket.
    pub global_tokens_available: f64,
    /// Per-resource snapshots, sorted by key.
    pub resources: Vec<ResourceSnapshot>,
}
