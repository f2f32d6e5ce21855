//! Contracts of the subsystems that own cluster-scoped resources
//!
//! Namespaces, deployments, pods and the rest are owned elsewhere and only
//! reference a cluster by id. Teardown finds them by that id and removes
//! them one at a time.

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use outpost_common::Result;

use crate::access::AccessScope;

/// A resource owned by a dependent subsystem
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopedResource {
    /// Resource id within its subsystem
    pub id: String,
    /// Display name, for logs
    pub name: String,
}

impl ScopedResource {
    /// Create a resource reference
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Search-and-remove contract shared by every dependent subsystem
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScopedResources: Send + Sync {
    /// All resources belonging to a cluster
    async fn search_by_cluster_id(
        &self,
        scope: &AccessScope,
        cluster_id: &str,
    ) -> Result<Vec<ScopedResource>>;

    /// Remove one resource
    async fn remove(&self, scope: &AccessScope, cluster_id: &str, resource_id: &str)
        -> Result<()>;
}

/// Lifecycle state of a policy violation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ViolationState {
    /// Currently violating
    #[default]
    Active,
    /// Muted by a user
    Snoozed,
    /// No longer violating
    Resolved,
    /// Enforcement was attempted
    Attempted,
}

/// A policy violation raised against a deployment
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Alert {
    /// Alert id
    pub id: String,
    /// Deployment the alert concerns
    pub deployment_id: String,
    /// Cluster of that deployment
    pub cluster_id: String,
    /// Violated policy
    pub policy_name: String,
    /// Current state
    pub state: ViolationState,
}

/// Alert subsystem
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Active alerts for a deployment
    async fn search_active_by_deployment(
        &self,
        scope: &AccessScope,
        deployment_id: &str,
    ) -> Result<Vec<Alert>>;

    /// Mark an alert stale (resolved because its subject disappeared)
    async fn mark_stale(&self, scope: &AccessScope, alert_id: &str) -> Result<()>;
}

/// Notification pipeline for alert state changes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    /// Hand an alert to the notification pipeline; delivery is its concern
    async fn process_alert(&self, scope: &AccessScope, alert: &Alert);
}

/// Provisions per-cluster derived stores owned by other subsystems
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FlowStoreProvisioner: Send + Sync {
    /// Create the network flow store for a new cluster
    async fn create_flow_store(&self, scope: &AccessScope, cluster_id: &str) -> Result<()>;
}

/// Handles to every subsystem teardown has to visit
#[derive(Clone)]
pub struct Dependents {
    /// Namespace subsystem
    pub namespaces: Arc<dyn ScopedResources>,
    /// Deployment subsystem
    pub deployments: Arc<dyn ScopedResources>,
    /// Pod subsystem
    pub pods: Arc<dyn ScopedResources>,
    /// Node subsystem
    pub nodes: Arc<dyn ScopedResources>,
    /// External network entities
    pub network_entities: Arc<dyn ScopedResources>,
    /// Network baselines
    pub network_baselines: Arc<dyn ScopedResources>,
    /// Secret subsystem
    pub secrets: Arc<dyn ScopedResources>,
    /// Alert subsystem
    pub alerts: Arc<dyn AlertStore>,
    /// Alert notifications
    pub notifier: Arc<dyn AlertNotifier>,
}
