//! Outpost - cluster lifecycle core of a fleet-management control plane
//!
//! Outpost keeps the authoritative record of every monitored cluster and
//! drives each one from its first agent announcement to its teardown.
//!
//! # Modules
//!
//! - [`common`] - Errors, configuration, logging and metrics
//! - [`cluster`] - Registry, reconciliation, health and decommissioning

#![deny(missing_docs)]

pub use outpost_cluster as cluster;
pub use outpost_common as common;

pub use outpost_cluster::{ClusterRegistry, Collaborators, MemoryBackend};
pub use outpost_common::{Error, RegistryConfig, Result};
