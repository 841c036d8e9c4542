//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, pipeline diagnostics, and Prometheus
//! metrics. Used by container orchestrators, load balancers, and
//! monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status with a full pipeline snapshot
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (checks circuit breakers)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::admission::CircuitState;
use crate::application::{Pipeline, PipelineSnapshot};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Proxy version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Full pipeline snapshot.
    pub pipeline: PipelineSnapshot,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All upstream circuits closed.
    Healthy,
    /// Some upstream circuits open but fetching continues.
    Degraded,
    /// Every upstream circuit open.
    Unhealthy,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    pipeline: Arc<Pipeline>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, pipeline: Arc<Pipeline>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            pipeline,
        }
    }
}

impl std::fmt::Debug for HealthServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthServerState")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
#[derive(Debug)]
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let snapshot = state.pipeline.snapshot();

    // Ready unless every known upstream circuit is refusing calls
    if determine_health_status(&snapshot) == HealthStatus::Unhealthy {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let pipeline = state.pipeline.snapshot();
    let status = determine_health_status(&pipeline);

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        pipeline,
    }
}

/// Healthy while every circuit is closed, degraded while some are
/// open, unhealthy once all of them are.
///
/// A pipeline that has not fetched anything yet has no resources and
/// counts as healthy.
fn determine_health_status(snapshot: &PipelineSnapshot) -> HealthStatus {
    let resources = &snapshot.admission.resources;
    if resources.is_empty() {
        return HealthStatus::Healthy;
    }

    let open_count = resources
        .iter()
        .filter(|resource| resource.circuit.state == CircuitState::Open)
        .count();

    if open_count == 0 {
        HealthStatus::Healthy
    } else if open_count < resources.len() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{CircuitSnapshot, ResourceSnapshot};

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    fn resource(name: &str, state: CircuitState) -> ResourceSnapshot {
        ResourceSnapshot {
            resource: name.to_string(),
            tokens_available: 10.0,
            adaptive_delay_ms: 0,
            circuit: CircuitSnapshot {
                name: name.to_string(),
                state,
                recent_failures: 0,
                total_calls: 0,
                total_failures: 0,
                state_transitions: 0,
            },
        }
    }

    fn snapshot_with(resources: Vec<ResourceSnapshot>) -> PipelineSnapshot {
        PipelineSnapshot {
            admission: crate::admission::AdmissionSnapshot {
                global_tokens_available: 50.0,
                resources,
            },
            cache: crate::cache::CacheStats {
                entries: 0,
                hits: 0,
                misses: 0,
                stale_served: 0,
                refreshes: 0,
                refresh_failures: 0,
            },
            queue: crate::queue::QueueStats {
                depth: 0,
                running: 0,
                enqueued_total: 0,
                completed_total: 0,
                retried_total: 0,
                failed_total: 0,
            },
            backoff: crate::backoff::BackoffStats {
                tracked_entities: 0,
                cooling_down: 0,
            },
            subscriptions: crate::domain::subscription::TotalSubscriptionStats::default(),
            delivery: crate::delivery::DeliveryStats {
                connections: 0,
                delivered: 0,
                lagged: 0,
                evicted: 0,
            },
            publisher: crate::publisher::PublisherStats {
                tracked_channels: 0,
                published: 0,
                suppressed: 0,
                skipped_backoff: 0,
                fetch_failures: 0,
            },
        }
    }

    #[test]
    fn no_resources_is_healthy() {
        let snapshot = snapshot_with(vec![]);
        assert_eq!(determine_health_status(&snapshot), HealthStatus::Healthy);
    }

    #[test]
    fn all_circuits_closed_is_healthy() {
        let snapshot = snapshot_with(vec![
            resource("odds", CircuitState::Closed),
            resource("fixtures", CircuitState::HalfOpen),
        ]);
        assert_eq!(determine_health_status(&snapshot), HealthStatus::Healthy);
    }

    #[test]
    fn one_open_circuit_is_degraded() {
        let snapshot = snapshot_with(vec![
            resource("odds", CircuitState::Open),
            resource("fixtures", CircuitState::Closed),
        ]);
        assert_eq!(determine_health_status(&snapshot), HealthStatus::Degraded);
    }

    #[test]
    fn all_circuits_open_is_unhealthy() {
        let snapshot = snapshot_with(vec![
            resource("odds", CircuitState::Open),
            resource("fixtures", CircuitState::Open),
        ]);
        assert_eq!(determine_health_status(&snapshot), HealthStatus::Unhealthy);
    }
}
