//! In-memory collaborators
//!
//! DashMap-backed implementations of every storage, index, access and
//! dependent-subsystem contract. They back the end-to-end tests and let an
//! embedder run the registry without external services.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;

use outpost_common::{Error, Result};

use crate::access::{AccessChecker, AccessScope};
use crate::connection::{AgentRegistry, PhysicalClusterContinuity};
use crate::dependents::{
    Alert, AlertNotifier, AlertStore, Dependents, FlowStoreProvisioner, ScopedResource,
    ScopedResources, ViolationState,
};
use crate::model::{Cluster, HealthStatus};
use crate::registry::Collaborators;
use crate::store::{ClusterQuery, ClusterStore, HealthStore, Ranker, SearchIndex, SearchResult};

/// Cluster records keyed by id
#[derive(Default)]
pub struct MemoryClusterStore {
    records: DashMap<String, Cluster>,
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn get(&self, id: &str) -> Result<Option<Cluster>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn upsert(&self, cluster: &Cluster) -> Result<()> {
        let mut stored = cluster.clone();
        stored.health_status = None;
        stored.priority = 0;
        self.records.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.remove(id);
        Ok(())
    }

    async fn walk(&self) -> Result<Vec<Cluster>> {
        let mut all: Vec<Cluster> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.len())
    }
}

/// Health snapshots keyed by cluster id
#[derive(Default)]
pub struct MemoryHealthStore {
    records: DashMap<String, HealthStatus>,
}

#[async_trait]
impl HealthStore for MemoryHealthStore {
    async fn get(&self, id: &str) -> Result<Option<HealthStatus>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn get_many(&self, ids: &[String]) -> Result<(Vec<HealthStatus>, Vec<usize>)> {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            match self.records.get(id) {
                Some(status) => found.push(status.value().clone()),
                None => missing.push(i),
            }
        }
        Ok((found, missing))
    }

    async fn upsert_with_id(&self, id: &str, status: &HealthStatus) -> Result<()> {
        self.records.insert(id.to_string(), status.clone());
        Ok(())
    }

    async fn walk_all_with_id(&self) -> Result<Vec<(String, HealthStatus)>> {
        Ok(self
            .records
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.remove(id);
        Ok(())
    }
}

/// Index that evaluates queries against stored copies
#[derive(Default)]
pub struct MemorySearchIndex {
    docs: DashMap<String, Cluster>,
    failing: AtomicBool,
}

impl MemorySearchIndex {
    /// Indexed copy of a cluster
    pub fn indexed(&self, id: &str) -> Option<Cluster> {
        self.docs.get(id).map(|r| r.value().clone())
    }

    /// Make index writes fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::dependency("search-index", "index unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn add_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.check()?;
        self.docs.insert(cluster.id.clone(), cluster.clone());
        Ok(())
    }

    async fn add_clusters(&self, clusters: &[Cluster]) -> Result<()> {
        self.check()?;
        for cluster in clusters {
            self.docs.insert(cluster.id.clone(), cluster.clone());
        }
        Ok(())
    }

    async fn delete_cluster(&self, id: &str) -> Result<()> {
        self.docs.remove(id);
        Ok(())
    }

    async fn search(&self, query: &ClusterQuery) -> Result<Vec<SearchResult>> {
        let mut results: Vec<SearchResult> = self
            .docs
            .iter()
            .filter(|r| query.matches(r.value()))
            .map(|r| SearchResult {
                id: r.key().clone(),
                name: r.value().name.clone(),
            })
            .collect();
        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(results)
    }
}

/// Fixed ranks; unknown clusters rank 0
#[derive(Default)]
pub struct MemoryRanker {
    ranks: DashMap<String, i64>,
}

impl MemoryRanker {
    /// Set the rank of a cluster
    pub fn set_rank(&self, id: &str, rank: i64) {
        self.ranks.insert(id.to_string(), rank);
    }

    /// Whether a rank is held for the cluster
    pub fn contains(&self, id: &str) -> bool {
        self.ranks.contains_key(id)
    }
}

impl Ranker for MemoryRanker {
    fn get_rank_for_id(&self, id: &str) -> i64 {
        self.ranks.get(id).map(|r| *r.value()).unwrap_or_default()
    }

    fn remove(&self, id: &str) {
        self.ranks.remove(id);
    }
}

#[derive(Default)]
struct Grants {
    read_all: bool,
    write_all: bool,
    read: HashSet<String>,
    write: HashSet<String>,
}

/// Per-subject grants; the all-access scope is always allowed
#[derive(Default)]
pub struct MemoryAccessChecker {
    grants: DashMap<String, Grants>,
}

impl MemoryAccessChecker {
    /// Let `subject` read and write every cluster
    pub fn allow_all(&self, subject: &str) {
        let mut grants = self.grants.entry(subject.to_string()).or_default();
        grants.read_all = true;
        grants.write_all = true;
    }

    /// Let `subject` read every cluster
    pub fn allow_read_all(&self, subject: &str) {
        self.grants.entry(subject.to_string()).or_default().read_all = true;
    }

    /// Let `subject` read one cluster
    pub fn allow_read(&self, subject: &str, cluster_id: &str) {
        self.grants
            .entry(subject.to_string())
            .or_default()
            .read
            .insert(cluster_id.to_string());
    }

    /// Let `subject` write one cluster
    pub fn allow_write(&self, subject: &str, cluster_id: &str) {
        self.grants
            .entry(subject.to_string())
            .or_default()
            .write
            .insert(cluster_id.to_string());
    }
}

impl AccessChecker for MemoryAccessChecker {
    fn read_allowed(&self, scope: &AccessScope, cluster_id: Option<&str>) -> Result<bool> {
        if scope.is_all_access() {
            return Ok(true);
        }
        Ok(self.grants.get(scope.subject()).is_some_and(|g| {
            g.read_all || g.write_all || cluster_id.is_some_and(|id| g.read.contains(id))
        }))
    }

    fn write_allowed(&self, scope: &AccessScope, cluster_id: Option<&str>) -> Result<bool> {
        if scope.is_all_access() {
            return Ok(true);
        }
        Ok(self
            .grants
            .get(scope.subject())
            .is_some_and(|g| g.write_all || cluster_id.is_some_and(|id| g.write.contains(id))))
    }
}

/// Resources of one dependent subsystem, grouped by cluster id
///
/// `set_failing(true)` makes every call fail, to exercise teardown errors.
pub struct MemoryResources {
    subsystem: &'static str,
    items: DashMap<String, Vec<ScopedResource>>,
    failing: AtomicBool,
}

impl MemoryResources {
    /// Empty subsystem named `subsystem` in error messages
    pub fn new(subsystem: &'static str) -> Self {
        Self {
            subsystem,
            items: DashMap::new(),
            failing: AtomicBool::new(false),
        }
    }

    /// Add a resource owned by `cluster_id`
    pub fn add(&self, cluster_id: &str, resource: ScopedResource) {
        self.items
            .entry(cluster_id.to_string())
            .or_default()
            .push(resource);
    }

    /// Resources currently held for `cluster_id`
    pub fn count_for(&self, cluster_id: &str) -> usize {
        self.items.get(cluster_id).map(|r| r.len()).unwrap_or_default()
    }

    /// Make every call fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::dependency(self.subsystem, "store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ScopedResources for MemoryResources {
    async fn search_by_cluster_id(
        &self,
        _scope: &AccessScope,
        cluster_id: &str,
    ) -> Result<Vec<ScopedResource>> {
        self.check()?;
        Ok(self
            .items
            .get(cluster_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn remove(
        &self,
        _scope: &AccessScope,
        cluster_id: &str,
        resource_id: &str,
    ) -> Result<()> {
        self.check()?;
        if let Some(mut items) = self.items.get_mut(cluster_id) {
            items.retain(|r| r.id != resource_id);
        }
        Ok(())
    }
}

/// Alerts keyed by id
#[derive(Default)]
pub struct MemoryAlertStore {
    alerts: DashMap<String, Alert>,
    failing: AtomicBool,
}

impl MemoryAlertStore {
    /// Store an alert
    pub fn add(&self, alert: Alert) {
        self.alerts.insert(alert.id.clone(), alert);
    }

    /// Current copy of an alert
    pub fn get(&self, id: &str) -> Option<Alert> {
        self.alerts.get(id).map(|r| r.value().clone())
    }

    /// Make every call fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::dependency("alerts", "store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn search_active_by_deployment(
        &self,
        _scope: &AccessScope,
        deployment_id: &str,
    ) -> Result<Vec<Alert>> {
        self.check()?;
        let mut active: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|r| r.deployment_id == deployment_id && r.state == ViolationState::Active)
            .map(|r| r.value().clone())
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    async fn mark_stale(&self, _scope: &AccessScope, alert_id: &str) -> Result<()> {
        self.check()?;
        let mut alert = self
            .alerts
            .get_mut(alert_id)
            .ok_or_else(|| Error::dependency("alerts", format!("alert {alert_id} not found")))?;
        alert.state = ViolationState::Resolved;
        Ok(())
    }
}

/// Notifier that remembers what it was handed
#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    /// Alerts processed so far
    pub fn notified(&self) -> Vec<Alert> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AlertNotifier for RecordingNotifier {
    async fn process_alert(&self, _scope: &AccessScope, alert: &Alert) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
    }
}

/// Records which clusters have a flow store
#[derive(Default)]
pub struct MemoryFlowStores {
    created: DashMap<String, ()>,
    failing: AtomicBool,
}

impl MemoryFlowStores {
    /// Whether a flow store exists for the cluster
    pub fn has_store(&self, cluster_id: &str) -> bool {
        self.created.contains_key(cluster_id)
    }

    /// Make provisioning fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl FlowStoreProvisioner for MemoryFlowStores {
    async fn create_flow_store(&self, _scope: &AccessScope, cluster_id: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::dependency("flow-store", "provisioning unavailable"));
        }
        self.created.insert(cluster_id.to_string(), ());
        Ok(())
    }
}

/// A complete in-memory environment for a registry
///
/// Every collaborator is exposed so tests can seed and inspect it.
pub struct MemoryBackend {
    /// Cluster records
    pub clusters: Arc<MemoryClusterStore>,
    /// Health snapshots
    pub health: Arc<MemoryHealthStore>,
    /// Search index
    pub index: Arc<MemorySearchIndex>,
    /// Access grants
    pub access: Arc<MemoryAccessChecker>,
    /// Ranks
    pub ranker: Arc<MemoryRanker>,
    /// Live agent connections
    pub agents: Arc<AgentRegistry>,
    /// Flow stores
    pub flows: Arc<MemoryFlowStores>,
    /// Namespaces
    pub namespaces: Arc<MemoryResources>,
    /// Deployments
    pub deployments: Arc<MemoryResources>,
    /// Pods
    pub pods: Arc<MemoryResources>,
    /// Nodes
    pub nodes: Arc<MemoryResources>,
    /// External network entities
    pub network_entities: Arc<MemoryResources>,
    /// Network baselines
    pub network_baselines: Arc<MemoryResources>,
    /// Secrets
    pub secrets: Arc<MemoryResources>,
    /// Alerts
    pub alerts: Arc<MemoryAlertStore>,
    /// Notifications
    pub notifier: Arc<RecordingNotifier>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            clusters: Arc::default(),
            health: Arc::default(),
            index: Arc::default(),
            access: Arc::default(),
            ranker: Arc::default(),
            agents: Arc::new(AgentRegistry::new()),
            flows: Arc::default(),
            namespaces: Arc::new(MemoryResources::new("namespaces")),
            deployments: Arc::new(MemoryResources::new("deployments")),
            pods: Arc::new(MemoryResources::new("pods")),
            nodes: Arc::new(MemoryResources::new("nodes")),
            network_entities: Arc::new(MemoryResources::new("network-entities")),
            network_baselines: Arc::new(MemoryResources::new("network-baselines")),
            secrets: Arc::new(MemoryResources::new("secrets")),
            alerts: Arc::default(),
            notifier: Arc::default(),
        }
    }
}

impl MemoryBackend {
    /// Fresh, empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dependent subsystem with its name, for bulk seeding or failure injection
    pub fn resources(&self) -> HashMap<&'static str, Arc<MemoryResources>> {
        HashMap::from([
            ("namespaces", Arc::clone(&self.namespaces)),
            ("deployments", Arc::clone(&self.deployments)),
            ("pods", Arc::clone(&self.pods)),
            ("nodes", Arc::clone(&self.nodes)),
            ("network_entities", Arc::clone(&self.network_entities)),
            ("network_baselines", Arc::clone(&self.network_baselines)),
            ("secrets", Arc::clone(&self.secrets)),
        ])
    }

    /// Collaborator handles for [`crate::ClusterRegistry::new`]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            clusters: self.clusters.clone(),
            health: self.health.clone(),
            index: self.index.clone(),
            access: self.access.clone(),
            ranker: self.ranker.clone(),
            connections: self.agents.clone(),
            continuity: Arc::new(PhysicalClusterContinuity),
            flows: self.flows.clone(),
            dependents: Dependents {
                namespaces: self.namespaces.clone(),
                deployments: self.deployments.clone(),
                pods: self.pods.clone(),
                nodes: self.nodes.clone(),
                network_entities: self.network_entities.clone(),
                network_baselines: self.network_baselines.clone(),
                secrets: self.secrets.clone(),
                alerts: self.alerts.clone(),
                notifier: self.notifier.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_get_many_reports_missing_indexes() {
        let store = MemoryHealthStore::default();
        store
            .upsert_with_id("b", &HealthStatus::default())
            .await
            .unwrap();

        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let (found, missing) = store.get_many(&ids).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(missing, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_cluster_store_drops_derived_fields() {
        let store = MemoryClusterStore::default();
        let mut cluster = Cluster::named("prod");
        cluster.id = "c1".to_string();
        cluster.priority = 4;
        cluster.health_status = Some(HealthStatus::default());
        store.upsert(&cluster).await.unwrap();

        let stored = store.get("c1").await.unwrap().unwrap();
        assert_eq!(stored.priority, 0);
        assert!(stored.health_status.is_none());
    }

    #[test]
    fn test_access_grants() {
        let checker = MemoryAccessChecker::default();
        let alice = AccessScope::for_subject("alice");
        checker.allow_read("alice", "c1");

        assert!(checker.read_allowed(&alice, Some("c1")).unwrap());
        assert!(!checker.read_allowed(&alice, Some("c2")).unwrap());
        assert!(!checker.read_allowed(&alice, None).unwrap());
        assert!(!checker.write_allowed(&alice, Some("c1")).unwrap());
        assert!(checker
            .write_allowed(&AccessScope::all_access(), None)
            .unwrap());
    }

    #[tokio::test]
    async fn test_failing_resources() {
        let resources = MemoryResources::new("pods");
        resources.add("c1", ScopedResource::new("p1", "pod-1"));
        resources.set_failing(true);

        let scope = AccessScope::all_access();
        let err = resources
            .search_by_cluster_id(&scope, "c1")
            .await
            .unwrap_err();
        assert_eq!(err.context(), Some("pods"));

        resources.set_failing(false);
        resources.remove(&scope, "c1", "p1").await.unwrap();
        assert_eq!(resources.count_for("c1"), 0);
    }

    #[tokio::test]
    async fn test_mark_stale_resolves_alert() {
        let store = MemoryAlertStore::default();
        store.add(Alert {
            id: "a1".to_string(),
            deployment_id: "d1".to_string(),
            ..Default::default()
        });
        let scope = AccessScope::all_access();

        assert_eq!(
            store
                .search_active_by_deployment(&scope, "d1")
                .await
                .unwrap()
                .len(),
            1
        );
        store.mark_stale(&scope, "a1").await.unwrap();
        assert!(store
            .search_active_by_deployment(&scope, "d1")
            .await
            .unwrap()
            .is_empty());
    }
}
