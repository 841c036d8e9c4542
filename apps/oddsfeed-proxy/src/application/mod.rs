//! Application Layer - Pipeline assembly and orchestration.
//!
//! This layer owns the wiring between the domain and the adapters:
//! it builds the admission, cache, queue, backoff, and fan-out pieces
//! from one configuration and exposes the operations the binary and
//! the health endpoint actually call.

/// Pipeline assembly and whole-service diagnostics.
pub mod pipeline;

pub use pipeline::{Pipeline, PipelineSnapshot, RefreshJobHandler};
