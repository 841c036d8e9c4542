//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Publisher**: updates published, suppressed, and skipped per kind
//! - **Fetch**: upstream attempts, failures, and latency
//! - **Admission**: rate-limit denials and circuit transitions
//! - **Queue**: job throughput and depth
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::channel::DataKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "oddsfeed_publisher_published_total",
        "Updates pushed to at least one subscriber"
    );
    describe_counter!(
        "oddsfeed_publisher_suppressed_total",
        "Ticks suppressed because the payload hash was unchanged"
    );
    describe_counter!(
        "oddsfeed_publisher_skipped_backoff_total",
        "Ticks skipped because the entity was cooling down"
    );
    describe_counter!(
        "oddsfeed_publisher_fetch_failures_total",
        "Channel fetches that ended in failure"
    );

    describe_counter!(
        "oddsfeed_fetch_attempts_total",
        "Upstream fetch attempts by resource"
    );
    describe_counter!(
        "oddsfeed_fetch_rate_limited_total",
        "Upstream rate-limit responses by resource"
    );
    describe_counter!(
        "oddsfeed_circuit_opened_total",
        "Circuit breaker open transitions by resource"
    );

    describe_gauge!("oddsfeed_connections", "Connected subscriber streams");
    describe_gauge!(
        "oddsfeed_active_channels",
        "Channels with at least one subscriber"
    );
    describe_gauge!("oddsfeed_queue_depth", "Pending jobs in the queue");

    describe_histogram!(
        "oddsfeed_fetch_duration_seconds",
        "Wall time of upstream fetches by resource"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record one upstream fetch attempt.
pub fn record_fetch_attempt(kind: DataKind) {
    counter!("oddsfeed_fetch_attempts_total", "kind" => kind.as_str()).increment(1);
}

/// Record an upstream rate-limit response.
pub fn record_rate_limited(resource: &str) {
    counter!("oddsfeed_fetch_rate_limited_total", "resource" => resource.to_string()).increment(1);
}

/// Record a circuit breaker opening.
pub fn record_circuit_opened(resource: &str) {
    counter!("oddsfeed_circuit_opened_total", "resource" => resource.to_string()).increment(1);
}

/// Update the connected subscriber count.
pub fn set_connections(count: f64) {
    gauge!("oddsfeed_connections").set(count);
}

/// Update the active channel count for a kind.
pub fn set_active_channels(kind: DataKind, count: f64) {
    gauge!("oddsfeed_active_channels", "kind" => kind.as_str()).set(count);
}

/// Update the queue depth gauge.
pub fn set_queue_depth(count: f64) {
    gauge!("oddsfeed_queue_depth").set(count);
}

/// Record the wall time of one upstream fetch.
pub fn record_fetch_duration(kind: DataKind, duration: Duration) {
    histogram!("oddsfeed_fetch_duration_seconds", "kind" => kind.as_str())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        // The metrics crate drops recordings when no recorder is
        // installed; these must not panic.
        record_fetch_attempt(DataKind::Odds);
        record_rate_limited("scorecard");
        record_circuit_opened("odds");
        set_connections(3.0);
        set_active_channels(DataKind::Odds, 2.0);
        set_queue_depth(1.0);
        record_fetch_duration(DataKind::Fixtures, Duration::from_millis(12));
    }
}
