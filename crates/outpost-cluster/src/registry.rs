//! Cluster registry
//!
//! Entry point for everything that reads or changes cluster records. Reads
//! run concurrently; every mutation is serialised by one async lock so that
//! name uniqueness and the derived caches stay consistent with the store.
//! Each operation is gated by the access checker first.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use outpost_common::metrics::{self, ReconcileOutcome};
use outpost_common::{Error, RegistryConfig, Result};

use crate::access::{AccessChecker, AccessScope};
use crate::connection::{AgentCommand, ConnectionContinuity, ConnectionManager};
use crate::decommission::{CascadeJob, CascadeRunner, CascadeWorker, CompletionSignal};
use crate::dependents::{Dependents, FlowStoreProvisioner};
use crate::health::HealthTracker;
use crate::identity::IdentityCache;
use crate::model::{
    AuditLogFileState, Cluster, ClusterCertExpiryStatus, ClusterStatus, ClusterUpgradeStatus,
    HealthStatus, RegistrationAnnouncement, SensorIdentification,
};
use crate::persist::ClusterWriter;
use crate::reconcile::ReconciliationEngine;
use crate::store::{ClusterQuery, ClusterStore, HealthStore, Ranker, SearchIndex, SearchResult};

/// Handles to every external collaborator the registry uses
#[derive(Clone)]
pub struct Collaborators {
    /// Primary record store
    pub clusters: Arc<dyn ClusterStore>,
    /// Health snapshot store
    pub health: Arc<dyn HealthStore>,
    /// Search index
    pub index: Arc<dyn SearchIndex>,
    /// Access decisions
    pub access: Arc<dyn AccessChecker>,
    /// Priority ranking
    pub ranker: Arc<dyn Ranker>,
    /// Live agent connections
    pub connections: Arc<dyn ConnectionManager>,
    /// Replacement policy for agents
    pub continuity: Arc<dyn ConnectionContinuity>,
    /// Per-cluster flow store provisioning
    pub flows: Arc<dyn FlowStoreProvisioner>,
    /// Subsystems visited on teardown
    pub dependents: Dependents,
}

/// Owner of cluster records and their derived state
///
/// Share it behind an `Arc`; all methods take `&self`.
pub struct ClusterRegistry {
    lock: Mutex<()>,
    writer: Arc<ClusterWriter>,
    identity: Arc<IdentityCache>,
    health: Arc<HealthTracker>,
    access: Arc<dyn AccessChecker>,
    ranker: Arc<dyn Ranker>,
    connections: Arc<dyn ConnectionManager>,
    engine: ReconciliationEngine,
    worker: CascadeWorker,
}

impl ClusterRegistry {
    /// Build a registry and start its teardown worker
    ///
    /// Must be called inside a tokio runtime. Call [`Self::initialize`]
    /// before serving requests to load existing records.
    pub fn new(collab: Collaborators, config: RegistryConfig) -> Self {
        let identity = Arc::new(IdentityCache::new());
        let health = Arc::new(HealthTracker::new(collab.health));
        let writer = Arc::new(ClusterWriter::new(
            collab.clusters,
            collab.index,
            Arc::clone(&identity),
            config.default_admission_timeout_secs,
        ));
        let engine = ReconciliationEngine::new(
            Arc::clone(&writer),
            Arc::clone(&health),
            collab.continuity,
            collab.flows,
            config.cluster_move_grace_period,
        );
        let runner = CascadeRunner::new(
            Arc::clone(&collab.connections),
            Arc::clone(&collab.ranker),
            Arc::clone(&health),
            collab.dependents,
            config.connection_termination_timeout,
        );
        let worker = CascadeWorker::spawn(Arc::new(runner), config.cascade_queue_capacity);

        Self {
            lock: Mutex::new(()),
            writer,
            identity,
            health,
            access: collab.access,
            ranker: collab.ranker,
            connections: collab.connections,
            engine,
            worker,
        }
    }

    /// Load stored records into the caches and the index
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut clusters = self.writer.clusters.walk().await?;
        let mut health: HashMap<String, HealthStatus> =
            self.health.load_all().await?.into_iter().collect();
        for cluster in &mut clusters {
            self.identity.insert(&cluster.id, &cluster.name);
            cluster.health_status = health.remove(&cluster.id);
        }
        self.writer.index.add_clusters(&clusters).await?;

        metrics::set_clusters_registered(clusters.len());
        info!(clusters = clusters.len(), "Cluster registry initialized");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// One cluster, with health and priority attached
    pub async fn get(&self, scope: &AccessScope, id: &str) -> Result<Cluster> {
        self.ensure_read(scope, id)?;
        let mut cluster = self.writer.load(id).await?;
        self.decorate(std::slice::from_mut(&mut cluster)).await;
        Ok(cluster)
    }

    /// Every cluster the scope may read
    pub async fn get_many(&self, scope: &AccessScope) -> Result<Vec<Cluster>> {
        if self.access.read_allowed(scope, None)? {
            let mut clusters = self.writer.clusters.walk().await?;
            self.decorate(&mut clusters).await;
            return Ok(clusters);
        }
        self.search_clusters(scope, &ClusterQuery::all()).await
    }

    /// Whether a cluster with `id` exists
    pub async fn exists(&self, scope: &AccessScope, id: &str) -> Result<bool> {
        self.ensure_read(scope, id)?;
        Ok(self.identity.contains_id(id))
    }

    /// Name of the cluster with `id`
    pub async fn get_name(&self, scope: &AccessScope, id: &str) -> Result<Option<String>> {
        self.ensure_read(scope, id)?;
        Ok(self.identity.name_for(id))
    }

    /// Ids and names of readable clusters matching `query`
    pub async fn search(
        &self,
        scope: &AccessScope,
        query: &ClusterQuery,
    ) -> Result<Vec<SearchResult>> {
        let results = self.writer.index.search(query).await?;
        self.readable(scope, results)
    }

    /// Full records of readable clusters matching `query`
    pub async fn search_clusters(
        &self,
        scope: &AccessScope,
        query: &ClusterQuery,
    ) -> Result<Vec<Cluster>> {
        let results = self.search(scope, query).await?;
        let mut clusters = Vec::with_capacity(results.len());
        for result in results {
            // Removed between the index hit and the load
            if let Some(cluster) = self.writer.clusters.get(&result.id).await? {
                clusters.push(cluster);
            }
        }
        self.decorate(&mut clusters).await;
        Ok(clusters)
    }

    /// Number of readable clusters matching `query`
    pub async fn count(&self, scope: &AccessScope, query: &ClusterQuery) -> Result<usize> {
        if query.is_match_all() && self.access.read_allowed(scope, None)? {
            return self.writer.clusters.count().await;
        }
        Ok(self.search(scope, query).await?.len())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Create a cluster and return its new id
    ///
    /// The id must be unset and the name unused. If provisioning the flow
    /// store fails the error is returned but the cluster stays created.
    pub async fn create(&self, scope: &AccessScope, mut cluster: Cluster) -> Result<String> {
        self.ensure_write(scope, &cluster.id)?;
        let guard = self.lock.lock().await;

        let admitted = self.engine.admit(&guard, &mut cluster).await;
        metrics::set_clusters_registered(self.identity.len());
        admitted?;

        info!(cluster = %cluster.id, name = %cluster.name, "Cluster created");
        Ok(cluster.id)
    }

    /// Replace a cluster's configurable fields
    ///
    /// The name cannot change. Status and audit-log state are kept from the
    /// stored record. A live agent receives the new dynamic configuration;
    /// a failed push is only logged.
    pub async fn update(&self, scope: &AccessScope, mut cluster: Cluster) -> Result<()> {
        if cluster.id.is_empty() {
            return Err(Error::validation_for_field(
                &cluster.name,
                "id",
                "cluster id is required for an update",
            ));
        }
        self.ensure_write(scope, &cluster.id)?;

        {
            let _guard = self.lock.lock().await;
            let existing = self.writer.load(&cluster.id).await?;
            if existing.name != cluster.name {
                return Err(Error::conflict(
                    &existing.name,
                    format!(
                        "cluster name change from {} to {} not permitted",
                        existing.name, cluster.name
                    ),
                ));
            }
            cluster.status = existing.status;
            cluster.audit_log_state = existing.audit_log_state;
            self.writer.upsert(&mut cluster).await?;
        }
        info!(cluster = %cluster.id, name = %cluster.name, "Cluster updated");

        let Some(conn) = self.connections.get_connection(&cluster.id) else {
            return Ok(());
        };
        let command = AgentCommand::ClusterConfig {
            config: cluster.dynamic_config.unwrap_or_default(),
        };
        if let Err(e) = conn.inject_message(command).await {
            warn!(cluster = %cluster.id, error = %e, "Failed to push configuration to agent");
        }
        Ok(())
    }

    /// Merge a health report into the stored snapshot
    pub async fn update_health(
        &self,
        scope: &AccessScope,
        id: &str,
        status: &HealthStatus,
    ) -> Result<()> {
        require_id(id, "health")?;
        self.ensure_write(scope, id)?;
        let _guard = self.lock.lock().await;

        let update = self.health.record(id, status).await?;
        if !update.liveness_changed {
            return Ok(());
        }
        let Some(mut cluster) = self.writer.clusters.get(id).await? else {
            debug!(cluster = %id, "Health reported for unknown cluster");
            return Ok(());
        };
        cluster.health_status = Some(update.status);
        self.writer.index.add_cluster(&cluster).await
    }

    /// Replace the upgrade status
    pub async fn update_upgrade_status(
        &self,
        scope: &AccessScope,
        id: &str,
        upgrade_status: ClusterUpgradeStatus,
    ) -> Result<()> {
        self.modify_record(scope, id, |cluster| {
            cluster.status.get_or_insert_with(ClusterStatus::default).upgrade_status =
                Some(upgrade_status);
            Ok(())
        })
        .await
    }

    /// Replace the certificate expiry status
    pub async fn update_cert_expiry_status(
        &self,
        scope: &AccessScope,
        id: &str,
        cert_expiry_status: ClusterCertExpiryStatus,
    ) -> Result<()> {
        self.modify_record(scope, id, |cluster| {
            cluster
                .status
                .get_or_insert_with(ClusterStatus::default)
                .cert_expiry_status = Some(cert_expiry_status);
            Ok(())
        })
        .await
    }

    /// Replace the status block, keeping the upgrade and expiry parts
    pub async fn update_status(
        &self,
        scope: &AccessScope,
        id: &str,
        mut status: ClusterStatus,
    ) -> Result<()> {
        self.modify_record(scope, id, |cluster| {
            if let Some(existing) = cluster.status.take() {
                status.upgrade_status = existing.upgrade_status;
                status.cert_expiry_status = existing.cert_expiry_status;
            } else {
                status.upgrade_status = None;
                status.cert_expiry_status = None;
            }
            cluster.status = Some(status);
            Ok(())
        })
        .await
    }

    /// Record the identification of the most recent agent connection
    pub async fn update_sensor_identification(
        &self,
        scope: &AccessScope,
        id: &str,
        identification: SensorIdentification,
    ) -> Result<()> {
        self.modify_record(scope, id, |cluster| {
            cluster.most_recent_sensor_id = Some(identification);
            Ok(())
        })
        .await
    }

    /// Merge per-node audit log positions
    ///
    /// Nodes absent from `states` keep their stored position.
    pub async fn update_audit_log_file_states(
        &self,
        scope: &AccessScope,
        id: &str,
        states: BTreeMap<String, AuditLogFileState>,
    ) -> Result<()> {
        require_id(id, "audit log file states")?;
        if states.is_empty() {
            return Err(Error::validation_for_field(
                id,
                "audit_log_state",
                "no audit log file states provided",
            ));
        }
        self.modify_record(scope, id, |cluster| {
            cluster.audit_log_state.extend(states);
            Ok(())
        })
        .await
    }

    /// Remove a cluster and tear down everything that depends on it
    ///
    /// Returns once the record is gone. Teardown continues in the background
    /// and `done`, if given, receives its report.
    pub async fn remove(
        &self,
        scope: &AccessScope,
        id: &str,
        done: Option<CompletionSignal>,
    ) -> Result<()> {
        self.ensure_write(scope, id)?;
        let _guard = self.lock.lock().await;

        let cluster = self.writer.load(id).await?;
        self.writer.delete_record(id).await?;
        let deindexed = self.writer.index.delete_cluster(id).await;

        self.worker.submit(CascadeJob { cluster, done });
        metrics::set_clusters_registered(self.identity.len());
        info!(cluster = %id, "Cluster removed, teardown queued");
        deindexed
    }

    /// Create, adopt or reject a cluster from an agent announcement
    pub async fn reconcile(
        &self,
        scope: &AccessScope,
        announcement: &RegistrationAnnouncement,
    ) -> Result<Cluster> {
        self.ensure_write(scope, announcement.cluster_id.as_deref().unwrap_or_default())?;
        let guard = self.lock.lock().await;

        let reconciled = self
            .engine
            .reconcile(&guard, announcement, Utc::now())
            .await?;
        if reconciled.outcome == ReconcileOutcome::Created {
            metrics::set_clusters_registered(self.identity.len());
        }
        Ok(reconciled.cluster)
    }

    /// Teardowns queued or running
    pub fn pending_decommissions(&self) -> usize {
        self.worker.pending_jobs()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn ensure_read(&self, scope: &AccessScope, id: &str) -> Result<()> {
        if self.access.read_allowed(scope, scoped(id))? {
            Ok(())
        } else {
            Err(Error::access_denied(id))
        }
    }

    fn ensure_write(&self, scope: &AccessScope, id: &str) -> Result<()> {
        if self.access.write_allowed(scope, scoped(id))? {
            Ok(())
        } else {
            Err(Error::access_denied(id))
        }
    }

    /// Keep only results the scope may read
    fn readable(
        &self,
        scope: &AccessScope,
        results: Vec<SearchResult>,
    ) -> Result<Vec<SearchResult>> {
        if self.access.read_allowed(scope, None)? {
            return Ok(results);
        }
        let mut allowed = Vec::with_capacity(results.len());
        for result in results {
            if self.access.read_allowed(scope, Some(&result.id))? {
                allowed.push(result);
            }
        }
        Ok(allowed)
    }

    async fn decorate(&self, clusters: &mut [Cluster]) {
        self.health.populate(clusters).await;
        for cluster in clusters.iter_mut() {
            cluster.priority = self.ranker.get_rank_for_id(&cluster.id);
        }
    }

    /// Load, change and store a record under the write lock
    ///
    /// Status mutations bypass normalisation and the index: they do not
    /// touch configurable or searchable fields.
    async fn modify_record<F>(&self, scope: &AccessScope, id: &str, change: F) -> Result<()>
    where
        F: FnOnce(&mut Cluster) -> Result<()>,
    {
        require_id(id, "cluster")?;
        self.ensure_write(scope, id)?;
        let _guard = self.lock.lock().await;

        let mut cluster = self.writer.load(id).await?;
        change(&mut cluster)?;
        self.writer.clusters.upsert(&cluster).await
    }
}

fn scoped(id: &str) -> Option<&str> {
    (!id.is_empty()).then_some(id)
}

fn require_id(id: &str, what: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::validation_for_field(
            "",
            "id",
            format!("cannot update {what}: cluster id not provided"),
        ));
    }
    Ok(())
}
