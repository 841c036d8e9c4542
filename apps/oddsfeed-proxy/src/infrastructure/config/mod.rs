//! Configuration Module
//!
//! Configuration loading and dependency injection for the proxy service.

mod settings;

pub use settings::{ConfigError, Credentials, ProxyConfig, ServerSettings};
