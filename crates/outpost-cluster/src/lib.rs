//! Outpost Cluster - cluster lifecycle core
//!
//! This crate owns the records of every monitored cluster:
//!
//! - **Registry**: access-checked reads and serialised writes over cluster records
//! - **Reconciliation**: creating or adopting clusters from agent announcements
//! - **Health**: per-cluster liveness snapshots merged into records on read
//! - **Decommission**: background teardown of everything a removed cluster owned
//! - **Identity cache**: id/name lookups without touching the store
//!
//! Storage, search, access control and the dependent subsystems are traits;
//! [`memory`] has in-memory implementations of all of them.

pub mod access;
pub mod connection;
pub mod decommission;
pub mod defaults;
pub mod dependents;
pub mod health;
pub mod identity;
pub mod memory;
pub mod model;
mod persist;
mod reconcile;
pub mod registry;
pub mod store;

pub use access::{AccessChecker, AccessScope};
pub use connection::{
    AgentCommand, AgentConnection, AgentConnectionHandle, AgentRegistry, ConnectionContinuity,
    ConnectionManager, ContinuityError, PhysicalClusterContinuity, SendError,
};
pub use decommission::{
    CascadeFailure, CascadeReport, CompletionSignal, ConnectionOutcome, Subsystem,
    TERMINATION_REASON,
};
pub use dependents::{
    Alert, AlertNotifier, AlertStore, Dependents, FlowStoreProvisioner, ScopedResource,
    ScopedResources, ViolationState,
};
pub use health::{HealthTracker, HealthUpdate};
pub use identity::IdentityCache;
pub use memory::MemoryBackend;
pub use model::{
    AuditLogFileState, Cluster, ClusterCertExpiryStatus, ClusterStatus, ClusterType,
    ClusterUpgradeStatus, CollectionMethod, CompleteClusterConfig, DynamicConfig, HealthLevel,
    HealthStatus, ManagedConfigInit, RegistrationAnnouncement, SensorIdentification,
};
pub use registry::{ClusterRegistry, Collaborators};
pub use store::{ClusterQuery, ClusterStore, HealthStore, Ranker, SearchIndex, SearchResult};
