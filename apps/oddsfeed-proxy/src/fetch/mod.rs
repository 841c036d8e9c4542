//! Resilient Fetch
//!
//! Wraps every upstream call in admission control and retry logic.
//! The [`Fetcher`] asks the [`AdmissionController`] for permission,
//! honors the resource's adaptive delay, runs the operation, and
//! retries transient failures with exponential backoff.

pub mod retry;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::admission::{AdmissionController, AdmissionDenied};

pub use retry::{BackoffCalculator, RetryPolicy, is_retryable_status};

// ============================================================================
// Errors
// ============================================================================

/// Errors produced by upstream fetches.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Upstream answered 429 or the local budget refused the call.
    #[error("rate limited: {reason}")]
    RateLimited {
        /// Why the call was rate limited.
        reason: String,
        /// Suggested wait before retrying, when the upstream sent one.
        retry_after: Option<Duration>,
    },

    /// The request did not complete in time.
    #[error("upstream timeout after {elapsed:?}")]
    Timeout {
        /// How long the attempt ran before timing out.
        elapsed: Duration,
    },

    /// Upstream returned a failure status.
    #[error("upstream error (status {status}): {message}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// The response body could not be parsed.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The resource's circuit breaker is open.
    #[error("circuit open for resource {resource}")]
    CircuitOpen {
        /// Resource whose circuit refused the call.
        resource: String,
    },

    /// All retry attempts failed.
    #[error("retries exhausted after {attempts} attempts, last error: {last_error}")]
    Exhausted {
        /// Total attempts made.
        attempts: u32,
        /// The final attempt's error.
        #[source]
        last_error: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether a retry could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout { .. } => true,
            Self::Upstream { status, .. } => is_retryable_status(*status),
            Self::Malformed(_) | Self::CircuitOpen { .. } | Self::Exhausted { .. } => false,
        }
    }

    /// Whether this error is a rate-limit signal.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

// ============================================================================
// Fetcher
// ============================================================================

/// Admission-gated, retrying executor for upstream operations.
///
/// The operation closure is invoked once per attempt and must produce
/// an independent future each time.
#[derive(Debug)]
pub struct Fetcher {
    admission: Arc<AdmissionController>,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl Fetcher {
    /// Create a fetcher sharing the given admission controller.
    #[must_use]
    pub const fn new(
        admission: Arc<AdmissionController>,
        policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            admission,
            policy,
            request_timeout,
        }
    }

    /// The admission controller behind this fetcher.
    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Run `op` against `resource_key` with admission and retries.
    ///
    /// Before each attempt the resource's adaptive delay is applied and
    /// an admission token is acquired. Transient errors are retried per
    /// the policy; permanent errors return immediately.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::CircuitOpen`] without attempting when the
    /// circuit refuses the call, [`FetchError::Exhausted`] when retries
    /// run out, or the terminal error for non-retryable failures.
    pub async fn fetch<T, F, Fut>(&self, resource_key: &str, op: F) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut backoff = BackoffCalculator::new(&self.policy);
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let delay = self.admission.adaptive_delay(resource_key);
            if !delay.is_zero() {
                tracing::debug!(
                    resource = resource_key,
                    delay_ms = delay.as_millis() as u64,
                    "Applying adaptive delay before attempt"
                );
                tokio::time::sleep(delay).await;
            }

            let error = match self.admission.acquire_or_wait(resource_key, 1, None).await {
                Err(AdmissionDenied::CircuitOpen) => {
                    // No call was made; the breaker never hears about it.
                    return Err(FetchError::CircuitOpen {
                        resource: resource_key.to_string(),
                    });
                }
                Err(denied) => FetchError::RateLimited {
                    reason: denied.to_string(),
                    retry_after: None,
                },
                Ok(()) => match tokio::time::timeout(self.request_timeout, op())
                    .await
                    .unwrap_or(Err(FetchError::Timeout {
                        elapsed: self.request_timeout,
                    })) {
                    Ok(value) => {
                        self.admission.record_success(resource_key);
                        return Ok(value);
                    }
                    Err(error) => {
                        if error.is_rate_limited() {
                            self.admission.record_rate_limited(resource_key);
                        } else {
                            self.admission.record_failure(resource_key);
                        }
                        error
                    }
                },
            };

            tracing::warn!(
                resource = resource_key,
                attempt = attempts,
                error = %error,
                "Upstream fetch attempt failed"
            );

            if !error.is_retryable() {
                return Err(error);
            }

            // Honor an upstream Retry-After over our own schedule.
            let retry_after = match &error {
                FetchError::RateLimited { retry_after, .. } => *retry_after,
                _ => None,
            };

            match retry_after.filter(|_| backoff.has_remaining_attempts()) {
                Some(hinted) => {
                    let _ = backoff.next_backoff();
                    tokio::time::sleep(hinted).await;
                }
                None => match backoff.next_backoff() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        return Err(FetchError::Exhausted {
                            attempts,
                            last_error: Box::new(error),
                        });
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::admission::{AdmissionConfig, CircuitConfig, RateBudget};

    fn test_admission() -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(AdmissionConfig {
            per_resource: RateBudget::new(100, 100.0),
            global: RateBudget::new(100, 100.0),
            circuit: CircuitConfig {
                failure_threshold: 50,
                ..CircuitConfig::default()
            },
            adaptive_delay_initial: Duration::from_millis(10),
            adaptive_delay_max: Duration::from_millis(40),
            acquire_timeout: Duration::from_millis(200),
            acquire_poll_interval: Duration::from_millis(10),
        }))
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn successful_fetch_returns_value() {
        let fetcher = Fetcher::new(test_admission(), fast_policy(), Duration::from_secs(1));
        let result: Result<u32, _> = fetcher.fetch("odds", || async { Ok(42) }).await;
        assert_eq!(result.ok(), Some(42));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let fetcher = Fetcher::new(test_admission(), fast_policy(), Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = fetcher
            .fetch("odds", || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(FetchError::Upstream {
                            status: 503,
                            message: "unavailable".into(),
                        })
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let fetcher = Fetcher::new(test_admission(), fast_policy(), Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = fetcher
            .fetch("odds", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(FetchError::Timeout {
                        elapsed: Duration::from_millis(1),
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(FetchError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_error_fails_fast() {
        let fetcher = Fetcher::new(test_admission(), fast_policy(), Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = fetcher
            .fetch("odds", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Malformed("truncated json".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(FetchError::Malformed(_))));
    }

    #[tokio::test]
    async fn open_circuit_prevents_any_attempt() {
        let admission = test_admission();
        let fetcher = Fetcher::new(Arc::clone(&admission), fast_policy(), Duration::from_secs(1));

        for _ in 0..50 {
            admission.record_failure("odds");
        }

        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = fetcher
            .fetch("odds", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(1) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(result, Err(FetchError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn slow_operation_times_out() {
        let fetcher = Fetcher::new(
            test_admission(),
            RetryPolicy {
                max_attempts: 1,
                ..fast_policy()
            },
            Duration::from_millis(20),
        );

        let result: Result<u32, _> = fetcher
            .fetch("odds", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            })
            .await;

        match result {
            Err(FetchError::Exhausted { last_error, .. }) => {
                assert!(matches!(*last_error, FetchError::Timeout { .. }));
            }
            other => panic!("expected exhausted timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_error_widens_adaptive_delay() {
        let admission = test_admission();
        let fetcher = Fetcher::new(Arc::clone(&admission), fast_policy(), Duration::from_secs(1));

        let _: Result<u32, _> = fetcher
            .fetch("odds", || async {
                Err(FetchError::RateLimited {
                    reason: "429 from upstream".into(),
                    retry_after: Some(Duration::from_millis(1)),
                })
            })
            .await;

        assert!(admission.adaptive_delay("odds") > Duration::ZERO);
    }
}
