#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call,
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss
    )
)]

//! Oddsfeed Proxy - Sports Data Distribution Pipeline
//!
//! A proxy service that polls a rate-limited sports data vendor once
//! per channel and fans results out to many downstream subscribers.
//! Admission control, retries, refresh-ahead caching, and per-entity
//! backoff sit between the tick schedule and the vendor so bursty
//! subscriber demand never becomes bursty upstream traffic.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Channels, subscriptions, and content hashing
//!   - `channel`: Data kinds, channel identity, payload hashing
//!   - `subscription`: Per-kind subscription registry
//!
//! - **Application**: Pipeline assembly
//!   - `pipeline`: Wires every component from one configuration
//!
//! - **Pipeline components**
//!   - `admission`: Token buckets, circuit breakers, adaptive delay
//!   - `fetch`: Retry-wrapped fetch through admission control
//!   - `upstream`: HTTP vendor client
//!   - `cache`: Refresh-ahead cache with single-flight fetches
//!   - `queue`: Priority job queue for forced refreshes
//!   - `backoff`: Per-entity failure cooldowns
//!   - `delivery`: Per-connection event channels
//!   - `publisher`: Tick-driven fan-out with dedup
//!
//! - **Infrastructure**: Config, telemetry, metrics, health endpoint
//!
//! # Data Flow
//!
//! ```text
//!                 +-----------+     +-------+     +-----------+
//! Vendor HTTP <---| Admission |<----| Cache |<----| Publisher |---> Client 1
//!                 | + Retry   |     |       |     |  ticks    |---> Client 2
//!                 +-----------+     +-------+     +-----------+---> Client N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Channel and subscription types.
pub mod domain;

/// Application layer - Pipeline assembly.
pub mod application;

/// Admission control - Token buckets, circuit breakers, adaptive delay.
pub mod admission;

/// Fetch layer - Retries wrapped around admission control.
pub mod fetch;

/// Upstream vendor HTTP client.
pub mod upstream;

/// Refresh-ahead cache with single-flight fetches.
pub mod cache;

/// Priority job queue for forced refreshes.
pub mod queue;

/// Per-entity failure backoff.
pub mod backoff;

/// Per-connection delivery channels.
pub mod delivery;

/// Tick-driven fan-out publisher.
pub mod publisher;

/// Infrastructure layer - Config, telemetry, metrics, health.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::channel::{Channel, ChannelState, DataKind, content_hash};
pub use domain::subscription::{
    ConnectionId, SubscriptionRegistry, SubscriptionStats, TotalSubscriptionStats,
};

// Pipeline
pub use application::{Pipeline, PipelineSnapshot, RefreshJobHandler};

// Admission control
pub use admission::{
    AdmissionConfig, AdmissionController, AdmissionDenied, AdmissionSnapshot, CircuitBreaker,
    CircuitConfig, CircuitState, RateBudget, TokenBucket,
};

// Fetching
pub use fetch::{FetchError, Fetcher, RetryPolicy};
pub use upstream::{HttpUpstreamConfig, HttpUpstreamProvider, UpstreamProvider};

// Caching and scheduling
pub use backoff::{BackoffConfig, BackoffTracker};
pub use cache::{CacheConfig, CacheOptions, CacheUpdate, CachedValue, Freshness, RefreshAheadCache};
pub use queue::{Job, JobHandler, JobQueue, JobType, QueueConfig};

// Delivery
pub use delivery::{DeliveryHub, DeliveryStats, UpdateEvent};
pub use publisher::{FanOutPublisher, PublisherConfig, PublisherStats};

// Infrastructure config
pub use infrastructure::config::{ConfigError, Credentials, ProxyConfig, ServerSettings};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState, HealthStatus};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
