//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the configuration, observability, and HTTP
//! surfaces wrapped around the pipeline.

/// Configuration loading from the environment.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
