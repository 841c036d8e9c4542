//! Domain layer - Core pipeline types with no external service dependencies.

/// Channels, data kinds, and content hashing.
pub mod channel;

/// Subscription tracking and reference counting.
pub mod subscription;
