//! Proxy Configuration Settings
//!
//! Configuration types for the odds feed proxy, loaded from environment
//! variables.

use std::time::Duration;

use crate::admission::{AdmissionConfig, CircuitConfig, RateBudget};
use crate::backoff::BackoffConfig;
use crate::cache::CacheConfig;
use crate::fetch::RetryPolicy;
use crate::publisher::PublisherConfig;
use crate::queue::QueueConfig;
use crate::upstream::HttpUpstreamConfig;

/// Feed API credentials.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String) -> Self {
        Self { api_key }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            health_port: 8083,
            metrics_port: 9091,
        }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Feed API credentials.
    pub credentials: Credentials,
    /// Feed API base URL.
    pub upstream_base_url: String,
    /// Per-request upstream timeout.
    pub request_timeout: Duration,
    /// Server port settings.
    pub server: ServerSettings,
    /// Admission control settings.
    pub admission: AdmissionConfig,
    /// Retry policy for upstream fetches.
    pub retry: RetryPolicy,
    /// Refresh-ahead cache settings.
    pub cache: CacheConfig,
    /// Job queue settings.
    pub queue: QueueConfig,
    /// Per-entity backoff settings.
    pub backoff: BackoffConfig,
    /// Publisher tick cadences.
    pub publisher: PublisherConfig,
    /// Outbound buffer per connection.
    pub connection_buffer: usize,
}

impl ProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ODDSFEED_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ODDSFEED_API_KEY".to_string()))?;
        if api_key.is_empty() {
            return Err(ConfigError::EmptyValue("ODDSFEED_API_KEY".to_string()));
        }

        let upstream_base_url = std::env::var("ODDSFEED_BASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("ODDSFEED_BASE_URL".to_string()))?;
        if upstream_base_url.is_empty() {
            return Err(ConfigError::EmptyValue("ODDSFEED_BASE_URL".to_string()));
        }

        let server = ServerSettings {
            health_port: parse_env_u16("ODDSFEED_HEALTH_PORT", ServerSettings::default().health_port),
            metrics_port: parse_env_u16(
                "ODDSFEED_METRICS_PORT",
                ServerSettings::default().metrics_port,
            ),
        };

        let admission_defaults = AdmissionConfig::default();
        let admission = AdmissionConfig {
            per_resource: RateBudget::new(
                parse_env_u32(
                    "ODDSFEED_RESOURCE_BUCKET_CAPACITY",
                    admission_defaults.per_resource.capacity,
                ),
                parse_env_f64(
                    "ODDSFEED_RESOURCE_REFILL_PER_SEC",
                    admission_defaults.per_resource.refill_per_sec,
                ),
            ),
            global: RateBudget::new(
                parse_env_u32(
                    "ODDSFEED_GLOBAL_BUCKET_CAPACITY",
                    admission_defaults.global.capacity,
                ),
                parse_env_f64(
                    "ODDSFEED_GLOBAL_REFILL_PER_SEC",
                    admission_defaults.global.refill_per_sec,
                ),
            ),
            circuit: CircuitConfig {
                failure_threshold: parse_env_u32(
                    "ODDSFEED_CIRCUIT_FAILURE_THRESHOLD",
                    admission_defaults.circuit.failure_threshold,
                ),
                monitoring_window: parse_env_duration_secs(
                    "ODDSFEED_CIRCUIT_WINDOW_SECS",
                    admission_defaults.circuit.monitoring_window,
                ),
                reset_timeout: parse_env_duration_secs(
                    "ODDSFEED_CIRCUIT_RESET_SECS",
                    admission_defaults.circuit.reset_timeout,
                ),
                success_threshold: parse_env_u32(
                    "ODDSFEED_CIRCUIT_SUCCESS_THRESHOLD",
                    admission_defaults.circuit.success_threshold,
                ),
            },
            ..admission_defaults
        };

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_env_u32("ODDSFEED_RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts),
            initial_backoff: parse_env_duration_millis(
                "ODDSFEED_RETRY_INITIAL_MS",
                retry_defaults.initial_backoff,
            ),
            ..retry_defaults
        };

        let cache_defaults = CacheConfig::default();
        let cache = CacheConfig {
            default_ttl: parse_env_duration_millis(
                "ODDSFEED_CACHE_TTL_MS",
                cache_defaults.default_ttl,
            ),
            refresh_threshold: parse_env_f64(
                "ODDSFEED_CACHE_REFRESH_THRESHOLD",
                cache_defaults.refresh_threshold,
            ),
            ..cache_defaults
        };

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            workers_per_type: parse_env_usize(
                "ODDSFEED_QUEUE_WORKERS",
                queue_defaults.workers_per_type,
            ),
            jobs_per_sec: parse_env_f64("ODDSFEED_QUEUE_JOBS_PER_SEC", queue_defaults.jobs_per_sec),
            max_attempts: parse_env_u32(
                "ODDSFEED_QUEUE_MAX_ATTEMPTS",
                queue_defaults.max_attempts,
            ),
            ..queue_defaults
        };

        let publisher_defaults = PublisherConfig::default();
        let publisher = PublisherConfig {
            odds_tick: parse_env_duration_millis(
                "ODDSFEED_ODDS_TICK_MS",
                publisher_defaults.odds_tick,
            ),
            scorecard_tick: parse_env_duration_secs(
                "ODDSFEED_SCORECARD_TICK_SECS",
                publisher_defaults.scorecard_tick,
            ),
            fixtures_tick: parse_env_duration_secs(
                "ODDSFEED_FIXTURES_TICK_SECS",
                publisher_defaults.fixtures_tick,
            ),
            ..publisher_defaults
        };

        Ok(Self {
            credentials: Credentials::new(api_key),
            upstream_base_url,
            request_timeout: parse_env_duration_millis(
                "ODDSFEED_REQUEST_TIMEOUT_MS",
                Duration::from_secs(5),
            ),
            server,
            admission,
            retry,
            cache,
            queue,
            backoff: BackoffConfig::default(),
            publisher,
            connection_buffer: parse_env_usize("ODDSFEED_CONNECTION_BUFFER", 256),
        })
    }

    /// Settings for the HTTP upstream adapter.
    #[must_use]
    pub fn upstream(&self) -> HttpUpstreamConfig {
        HttpUpstreamConfig {
            base_url: self.upstream_base_url.clone(),
            api_key: self.credentials.api_key().to_string(),
            request_timeout: self.request_timeout,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
