//! Agent connection tracking
//!
//! Keeps the live connection of every cluster's agent, lets the registry
//! push configuration to it, and lets teardown terminate it and wait for the
//! connection task to finish.
//!
//! # Traits
//!
//! - `ConnectionManager`: lookup of live connections by cluster id
//! - `AgentConnectionHandle`: what the registry may do with one connection
//! - `ConnectionContinuity`: whether a new agent may replace a previous one

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::model::{DynamicConfig, SensorIdentification};

/// Command pushed from the control plane to an agent
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentCommand {
    /// Apply a new dynamic configuration
    ClusterConfig {
        /// Configuration to apply
        config: DynamicConfig,
    },
}

/// Error sending to an agent
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The agent's channel is closed (disconnected or terminated)
    #[error("agent channel closed")]
    ChannelClosed,
}

/// Operations the registry performs on one live connection
#[async_trait]
pub trait AgentConnectionHandle: Send + Sync {
    /// Cluster this connection serves
    fn cluster_id(&self) -> &str;

    /// Queue a command for the agent
    async fn inject_message(&self, command: AgentCommand) -> Result<(), SendError>;

    /// Ask the connection to shut down
    fn terminate(&self, reason: &str);

    /// Resolves once the connection task has finished
    async fn stopped(&self);
}

/// Lookup of live agent connections
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionManager: Send + Sync {
    /// Live connection for a cluster, if one exists
    fn get_connection(&self, cluster_id: &str) -> Option<Arc<dyn AgentConnectionHandle>>;
}

/// A connected agent
///
/// The connection task owns the receiving ends: it drains `command_tx`,
/// watches for termination, and calls [`AgentRegistry::unregister`] when it
/// exits, which is what [`AgentConnectionHandle::stopped`] waits for.
pub struct AgentConnection {
    /// Cluster id this agent serves
    pub cluster_id: String,
    /// Agent version
    pub agent_version: String,
    command_tx: mpsc::Sender<AgentCommand>,
    termination: watch::Sender<Option<String>>,
    stopped: watch::Sender<bool>,
}

impl AgentConnection {
    /// Create a new agent connection
    pub fn new(
        cluster_id: String,
        agent_version: String,
        command_tx: mpsc::Sender<AgentCommand>,
    ) -> Self {
        let (termination, _) = watch::channel(None);
        let (stopped, _) = watch::channel(false);
        Self {
            cluster_id,
            agent_version,
            command_tx,
            termination,
            stopped,
        }
    }

    /// Reason the connection was asked to terminate, if it was
    pub fn terminated(&self) -> Option<String> {
        self.termination.borrow().clone()
    }

    /// Receiver the connection task selects on to notice termination
    pub fn subscribe_termination(&self) -> watch::Receiver<Option<String>> {
        self.termination.subscribe()
    }

    /// Mark the connection task as finished
    pub fn mark_stopped(&self) {
        self.stopped.send_replace(true);
    }

    /// Whether the connection task has finished
    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }
}

#[async_trait]
impl AgentConnectionHandle for AgentConnection {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    async fn inject_message(&self, command: AgentCommand) -> Result<(), SendError> {
        if self.terminated().is_some() {
            return Err(SendError::ChannelClosed);
        }
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    fn terminate(&self, reason: &str) {
        let first = self.termination.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.to_string());
            true
        });
        if first {
            info!(cluster = %self.cluster_id, reason, "Terminating agent connection");
        }
    }

    async fn stopped(&self) {
        let mut rx = self.stopped.subscribe();
        // Sender lives in self, so the only error is unreachable while borrowed
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Registry of live agent connections, keyed by cluster id
///
/// Thread-safe registry using DashMap for concurrent access. At most one
/// connection per cluster: registering a new one terminates the old.
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Arc<AgentConnection>>,
}

impl AgentRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, terminating any connection it replaces
    pub fn register(&self, connection: AgentConnection) -> Arc<AgentConnection> {
        let cluster_id = connection.cluster_id.clone();
        let connection = Arc::new(connection);

        if let Some(previous) = self.agents.insert(cluster_id.clone(), Arc::clone(&connection)) {
            previous.terminate("replaced by a newer connection");
            info!(cluster = %cluster_id, "Agent reconnected");
        } else {
            info!(cluster = %cluster_id, "Agent connected");
        }
        connection
    }

    /// Remove a connection whose task has finished
    ///
    /// Only removes the entry if it is still `connection`, so a stale task
    /// exiting late cannot evict its replacement.
    pub fn unregister(&self, connection: &Arc<AgentConnection>) {
        connection.mark_stopped();
        let removed = self
            .agents
            .remove_if(&connection.cluster_id, |_, current| {
                Arc::ptr_eq(current, connection)
            })
            .is_some();
        if removed {
            info!(cluster = %connection.cluster_id, "Agent disconnected");
        }
    }

    /// Get the connection for a cluster
    pub fn get(&self, cluster_id: &str) -> Option<Arc<AgentConnection>> {
        self.agents.get(cluster_id).map(|r| Arc::clone(r.value()))
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is connected
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl ConnectionManager for AgentRegistry {
    fn get_connection(&self, cluster_id: &str) -> Option<Arc<dyn AgentConnectionHandle>> {
        self.get(cluster_id)
            .map(|c| c as Arc<dyn AgentConnectionHandle>)
    }
}

/// Why a new agent may not take over a cluster
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContinuityError {
    /// The identification points at a different physical cluster
    #[error("{field} changed from {previous:?} to {incoming:?}")]
    Mismatch {
        /// Field that differs
        field: &'static str,
        /// Stored value
        previous: String,
        /// Presented value
        incoming: String,
    },
    /// The new agent presented no identification
    #[error("no sensor identification presented")]
    Missing,
}

/// Decides whether a newly connecting agent may replace the previous one
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionContinuity: Send + Sync {
    /// Check `incoming` against the identification stored for the cluster
    fn check_replace(
        &self,
        incoming: &SensorIdentification,
        stored: &SensorIdentification,
    ) -> Result<(), ContinuityError>;
}

/// Allows replacement when both agents run in the same physical cluster
///
/// Namespace UIDs survive agent redeploys but differ between clusters, so
/// they identify the physical cluster. Pod-level fields are ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct PhysicalClusterContinuity;

impl ConnectionContinuity for PhysicalClusterContinuity {
    fn check_replace(
        &self,
        incoming: &SensorIdentification,
        stored: &SensorIdentification,
    ) -> Result<(), ContinuityError> {
        let fields: [(&'static str, &str, &str); 3] = [
            (
                "system_namespace_id",
                &stored.system_namespace_id,
                &incoming.system_namespace_id,
            ),
            (
                "default_namespace_id",
                &stored.default_namespace_id,
                &incoming.default_namespace_id,
            ),
            ("app_namespace", &stored.app_namespace, &incoming.app_namespace),
        ];
        for (field, previous, new) in fields {
            if previous != new {
                return Err(ContinuityError::Mismatch {
                    field,
                    previous: previous.to_string(),
                    incoming: new.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn create_test_connection(id: &str) -> (AgentConnection, mpsc::Receiver<AgentCommand>) {
        let (tx, rx) = mpsc::channel(16);
        (AgentConnection::new(id.to_string(), "4.5.0".to_string(), tx), rx)
    }

    fn identification(system: &str) -> SensorIdentification {
        SensorIdentification {
            system_namespace_id: system.to_string(),
            default_namespace_id: "default-uid".to_string(),
            app_namespace: "outpost".to_string(),
            app_namespace_id: "app-uid".to_string(),
            app_serviceaccount_id: "sa-uid".to_string(),
            k8s_node_name: "node-1".to_string(),
        }
    }

    #[test]
    fn test_registry_register_and_get() {
        let registry = AgentRegistry::new();
        let (conn, _rx) = create_test_connection("c1");
        registry.register(conn);

        assert_eq!(registry.len(), 1);
        assert!(registry.get("c1").is_some());
        assert!(registry.get_connection("c1").is_some());
        assert!(registry.get_connection("c2").is_none());
    }

    #[test]
    fn test_register_replacement_terminates_previous() {
        let registry = AgentRegistry::new();
        let (first, _rx1) = create_test_connection("c1");
        let first = registry.register(first);
        let (second, _rx2) = create_test_connection("c1");
        let second = registry.register(second);

        assert!(first.terminated().is_some());
        assert!(second.terminated().is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_unregister_keeps_replacement() {
        let registry = AgentRegistry::new();
        let (first, _rx1) = create_test_connection("c1");
        let first = registry.register(first);
        let (second, _rx2) = create_test_connection("c1");
        let second = registry.register(second);

        registry.unregister(&first);
        assert!(first.is_stopped());
        let current = registry.get("c1").unwrap();
        assert!(Arc::ptr_eq(&current, &second));

        registry.unregister(&second);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_inject_through_manager() {
        let registry = AgentRegistry::new();
        let (conn, mut rx) = create_test_connection("c1");
        registry.register(conn);

        let command = AgentCommand::ClusterConfig {
            config: DynamicConfig::default(),
        };
        let handle = registry.get_connection("c1").unwrap();
        assert_eq!(handle.cluster_id(), "c1");
        handle.inject_message(command.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(command));
    }

    #[tokio::test]
    async fn test_inject_after_terminate_fails() {
        let (conn, _rx) = create_test_connection("c1");
        conn.terminate("cluster was deleted");
        conn.terminate("second reason is ignored");

        assert_eq!(conn.terminated().as_deref(), Some("cluster was deleted"));
        let result = conn
            .inject_message(AgentCommand::ClusterConfig {
                config: DynamicConfig::default(),
            })
            .await;
        assert_eq!(result, Err(SendError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_stopped_resolves_when_task_exits() {
        let registry = Arc::new(AgentRegistry::new());
        let (conn, _rx) = create_test_connection("c1");
        let conn = registry.register(conn);

        // Connection task: exit once termination is requested
        let task = {
            let registry = Arc::clone(&registry);
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let mut termination = conn.subscribe_termination();
                let _ = termination.wait_for(|reason| reason.is_some()).await;
                registry.unregister(&conn);
            })
        };

        let handle = registry.get_connection("c1").unwrap();
        handle.terminate("cluster was deleted");
        tokio::time::timeout(Duration::from_secs(1), handle.stopped())
            .await
            .expect("connection should stop");
        task.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stopped_pending_while_running() {
        let (conn, _rx) = create_test_connection("c1");
        let result = tokio::time::timeout(Duration::from_millis(20), conn.stopped()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_same_physical_cluster_may_replace() {
        let stored = identification("kube-uid");
        let mut incoming = identification("kube-uid");
        incoming.k8s_node_name = "node-7".to_string();

        assert!(PhysicalClusterContinuity
            .check_replace(&incoming, &stored)
            .is_ok());
    }

    #[test]
    fn test_different_physical_cluster_rejected() {
        let stored = identification("kube-uid");
        let incoming = identification("other-uid");

        let err = PhysicalClusterContinuity
            .check_replace(&incoming, &stored)
            .unwrap_err();
        assert!(matches!(
            err,
            ContinuityError::Mismatch {
                field: "system_namespace_id",
                ..
            }
        ));
        assert!(err.to_string().contains("other-uid"));
    }
}
