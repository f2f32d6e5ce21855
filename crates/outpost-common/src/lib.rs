//! Common types for Outpost: errors, configuration, and observability

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use config::{EnvConfig, OsEnvConfig, RegistryConfig};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
