//! Cascading teardown of a removed cluster
//!
//! Removing a cluster deletes its record synchronously, then hands the rest
//! to a background worker: the live agent connection is terminated and every
//! resource other subsystems own for the cluster is removed. Teardown is
//! best effort. Failures are collected into a [`CascadeReport`] and never
//! stop the cascade; the optional completion signal always fires.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use outpost_common::metrics;

use crate::access::AccessScope;
use crate::connection::ConnectionManager;
use crate::dependents::{Dependents, ScopedResources, ViolationState};
use crate::health::HealthTracker;
use crate::model::Cluster;
use crate::store::Ranker;

/// Reason given to the agent when its cluster is removed
pub const TERMINATION_REASON: &str = "cluster was deleted";

/// Subsystem a teardown step belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subsystem {
    /// Health snapshot
    Health,
    /// Namespaces
    Namespaces,
    /// Deployments
    Deployments,
    /// Alerts on removed deployments
    Alerts,
    /// Pods
    Pods,
    /// Nodes
    Nodes,
    /// External network entities
    NetworkEntities,
    /// Network baselines
    NetworkBaselines,
    /// Secrets
    Secrets,
}

impl Subsystem {
    /// Label value for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::Namespaces => "namespaces",
            Self::Deployments => "deployments",
            Self::Alerts => "alerts",
            Self::Pods => "pods",
            Self::Nodes => "nodes",
            Self::NetworkEntities => "network_entities",
            Self::NetworkBaselines => "network_baselines",
            Self::Secrets => "secrets",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed teardown step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CascadeFailure {
    /// Subsystem the step belongs to
    pub subsystem: Subsystem,
    /// Resource the step was acting on; `None` for a failed search
    pub resource_id: Option<String>,
    /// Error text
    pub message: String,
}

/// What happened to the agent connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// No live connection existed
    NotConnected,
    /// Connection terminated and stopped in time
    Stopped,
    /// Connection did not stop within the timeout
    TimedOut,
}

/// Outcome of one cascade
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CascadeReport {
    /// Removed cluster id
    pub cluster_id: String,
    /// Removed cluster name
    pub cluster_name: String,
    /// Agent connection outcome
    pub connection: ConnectionOutcome,
    /// Resources removed, per subsystem
    pub removed: BTreeMap<Subsystem, usize>,
    /// Steps that failed
    pub failures: Vec<CascadeFailure>,
}

impl CascadeReport {
    fn new(cluster: &Cluster) -> Self {
        Self {
            cluster_id: cluster.id.clone(),
            cluster_name: cluster.name.clone(),
            connection: ConnectionOutcome::NotConnected,
            removed: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    /// Whether every step succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures recorded for one subsystem
    pub fn failures_for(&self, subsystem: Subsystem) -> impl Iterator<Item = &CascadeFailure> {
        self.failures
            .iter()
            .filter(move |f| f.subsystem == subsystem)
    }

    /// Number of resources removed from a subsystem
    pub fn removed_from(&self, subsystem: Subsystem) -> usize {
        self.removed.get(&subsystem).copied().unwrap_or_default()
    }

    fn failure_counts(&self) -> Vec<(&'static str, u64)> {
        let mut counts: BTreeMap<Subsystem, u64> = BTreeMap::new();
        for failure in &self.failures {
            *counts.entry(failure.subsystem).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|(subsystem, n)| (subsystem.as_str(), n))
            .collect()
    }
}

/// Fires once with the report when a cascade finishes
pub type CompletionSignal = oneshot::Sender<CascadeReport>;

/// Runs the teardown steps for one cluster
pub(crate) struct CascadeRunner {
    connections: Arc<dyn ConnectionManager>,
    ranker: Arc<dyn Ranker>,
    health: Arc<HealthTracker>,
    dependents: Dependents,
    termination_timeout: Duration,
}

impl CascadeRunner {
    pub(crate) fn new(
        connections: Arc<dyn ConnectionManager>,
        ranker: Arc<dyn Ranker>,
        health: Arc<HealthTracker>,
        dependents: Dependents,
        termination_timeout: Duration,
    ) -> Self {
        Self {
            connections,
            ranker,
            health,
            dependents,
            termination_timeout,
        }
    }

    pub(crate) async fn run(&self, cluster: &Cluster) -> CascadeReport {
        let started = Instant::now();
        let scope = AccessScope::all_access();
        let mut report = CascadeReport::new(cluster);
        let id = cluster.id.as_str();

        report.connection = self.terminate_connection(id).await;
        self.ranker.remove(id);
        if let Err(e) = self.health.forget(id).await {
            self.fail(&mut report, Subsystem::Health, None, e);
        }

        let deps = &self.dependents;
        self.remove_all(&scope, &mut report, Subsystem::Namespaces, deps.namespaces.as_ref())
            .await;
        self.remove_deployments(&scope, &mut report).await;
        let rest: [(Subsystem, &dyn ScopedResources); 5] = [
            (Subsystem::Pods, deps.pods.as_ref()),
            (Subsystem::Nodes, deps.nodes.as_ref()),
            (Subsystem::NetworkEntities, deps.network_entities.as_ref()),
            (Subsystem::NetworkBaselines, deps.network_baselines.as_ref()),
            (Subsystem::Secrets, deps.secrets.as_ref()),
        ];
        for (subsystem, resources) in rest {
            self.remove_all(&scope, &mut report, subsystem, resources).await;
        }

        let elapsed = started.elapsed();
        metrics::record_cascade(elapsed.as_secs_f64(), &report.failure_counts());
        info!(
            cluster = %report.cluster_id,
            name = %report.cluster_name,
            failures = report.failures.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Cluster teardown finished"
        );
        report
    }

    async fn terminate_connection(&self, cluster_id: &str) -> ConnectionOutcome {
        let Some(conn) = self.connections.get_connection(cluster_id) else {
            return ConnectionOutcome::NotConnected;
        };
        conn.terminate(TERMINATION_REASON);
        match tokio::time::timeout(self.termination_timeout, conn.stopped()).await {
            Ok(()) => ConnectionOutcome::Stopped,
            Err(_) => {
                warn!(
                    cluster = %cluster_id,
                    timeout = ?self.termination_timeout,
                    "Agent connection not terminated in time"
                );
                ConnectionOutcome::TimedOut
            }
        }
    }

    async fn remove_all(
        &self,
        scope: &AccessScope,
        report: &mut CascadeReport,
        subsystem: Subsystem,
        resources: &dyn ScopedResources,
    ) {
        let cluster_id = report.cluster_id.clone();
        let found = match resources.search_by_cluster_id(scope, &cluster_id).await {
            Ok(found) => found,
            Err(e) => {
                self.fail(report, subsystem, None, e);
                return;
            }
        };
        for resource in found {
            match resources.remove(scope, &cluster_id, &resource.id).await {
                Ok(()) => *report.removed.entry(subsystem).or_default() += 1,
                Err(e) => self.fail(report, subsystem, Some(resource.id), e),
            }
        }
    }

    /// Remove deployments, resolving their active alerts first
    async fn remove_deployments(&self, scope: &AccessScope, report: &mut CascadeReport) {
        let deps = &self.dependents;
        let cluster_id = report.cluster_id.clone();
        let deployments = match deps.deployments.search_by_cluster_id(scope, &cluster_id).await {
            Ok(found) => found,
            Err(e) => {
                self.fail(report, Subsystem::Deployments, None, e);
                return;
            }
        };

        for deployment in deployments {
            match deps
                .alerts
                .search_active_by_deployment(scope, &deployment.id)
                .await
            {
                Ok(alerts) => {
                    for mut alert in alerts {
                        match deps.alerts.mark_stale(scope, &alert.id).await {
                            Ok(()) => {
                                alert.state = ViolationState::Resolved;
                                deps.notifier.process_alert(scope, &alert).await;
                                *report.removed.entry(Subsystem::Alerts).or_default() += 1;
                            }
                            Err(e) => {
                                self.fail(report, Subsystem::Alerts, Some(alert.id.clone()), e)
                            }
                        }
                    }
                }
                Err(e) => self.fail(report, Subsystem::Alerts, Some(deployment.id.clone()), e),
            }

            match deps
                .deployments
                .remove(scope, &cluster_id, &deployment.id)
                .await
            {
                Ok(()) => *report.removed.entry(Subsystem::Deployments).or_default() += 1,
                Err(e) => self.fail(report, Subsystem::Deployments, Some(deployment.id), e),
            }
        }
    }

    fn fail(
        &self,
        report: &mut CascadeReport,
        subsystem: Subsystem,
        resource_id: Option<String>,
        err: impl fmt::Display,
    ) {
        error!(
            cluster = %report.cluster_id,
            subsystem = subsystem.as_str(),
            resource = resource_id.as_deref().unwrap_or("-"),
            error = %err,
            "Teardown step failed"
        );
        report.failures.push(CascadeFailure {
            subsystem,
            resource_id,
            message: err.to_string(),
        });
    }
}

/// A queued teardown
pub(crate) struct CascadeJob {
    pub(crate) cluster: Cluster,
    pub(crate) done: Option<CompletionSignal>,
}

/// Bounded queue of teardowns drained by one background task
pub(crate) struct CascadeWorker {
    tx: mpsc::Sender<CascadeJob>,
    runner: Arc<CascadeRunner>,
    pending: Arc<AtomicUsize>,
}

impl CascadeWorker {
    /// Start the drain task; must be called inside a tokio runtime
    pub(crate) fn spawn(runner: Arc<CascadeRunner>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<CascadeJob>(capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_runner = Arc::clone(&runner);
        let worker_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                complete(&worker_runner, &worker_pending, job).await;
            }
            debug!("Cascade queue closed");
        });

        Self {
            tx,
            runner,
            pending,
        }
    }

    /// Queue a teardown
    ///
    /// When the queue is full the teardown runs on its own task instead, so
    /// removal never waits on earlier cascades.
    pub(crate) fn submit(&self, job: CascadeJob) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let job = match self.tx.try_send(job) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(job)) => job,
            Err(mpsc::error::TrySendError::Closed(job)) => job,
        };

        warn!(
            cluster = %job.cluster.id,
            "Cascade queue unavailable, running teardown on its own task"
        );
        let runner = Arc::clone(&self.runner);
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            complete(&runner, &pending, job).await;
        });
    }

    /// Teardowns queued or running
    pub(crate) fn pending_jobs(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

async fn complete(runner: &CascadeRunner, pending: &AtomicUsize, job: CascadeJob) {
    let report = runner.run(&job.cluster).await;
    pending.fetch_sub(1, Ordering::SeqCst);
    if let Some(done) = job.done {
        if done.send(report).is_err() {
            debug!(cluster = %job.cluster.id, "Teardown completion receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{AgentConnection, AgentConnectionHandle, MockConnectionManager};
    use crate::dependents::{
        Alert, MockAlertNotifier, MockAlertStore, MockScopedResources, ScopedResource,
    };
    use crate::store::{MockHealthStore, MockRanker};
    use outpost_common::Error;

    fn empty() -> MockScopedResources {
        let mut resources = MockScopedResources::new();
        resources
            .expect_search_by_cluster_id()
            .returning(|_, _| Ok(vec![]));
        resources
    }

    fn failing() -> MockScopedResources {
        let mut resources = MockScopedResources::new();
        resources
            .expect_search_by_cluster_id()
            .returning(|_, _| Err(Error::dependency("search", "unavailable")));
        resources
    }

    fn holding(ids: &'static [&'static str]) -> MockScopedResources {
        let mut resources = MockScopedResources::new();
        resources.expect_search_by_cluster_id().returning(move |_, _| {
            Ok(ids.iter().map(|id| ScopedResource::new(*id, *id)).collect())
        });
        resources
    }

    struct Parts {
        connections: MockConnectionManager,
        ranker: MockRanker,
        health: MockHealthStore,
        namespaces: MockScopedResources,
        deployments: MockScopedResources,
        pods: MockScopedResources,
        nodes: MockScopedResources,
        network_entities: MockScopedResources,
        network_baselines: MockScopedResources,
        secrets: MockScopedResources,
        alerts: MockAlertStore,
        notifier: MockAlertNotifier,
        timeout: Duration,
    }

    impl Parts {
        fn new() -> Self {
            let mut connections = MockConnectionManager::new();
            connections.expect_get_connection().returning(|_| None);
            let mut ranker = MockRanker::new();
            ranker.expect_remove().returning(|_| ());
            let mut health = MockHealthStore::new();
            health.expect_delete().returning(|_| Ok(()));
            Self {
                connections,
                ranker,
                health,
                namespaces: empty(),
                deployments: empty(),
                pods: empty(),
                nodes: empty(),
                network_entities: empty(),
                network_baselines: empty(),
                secrets: empty(),
                alerts: MockAlertStore::new(),
                notifier: MockAlertNotifier::new(),
                timeout: Duration::from_secs(5),
            }
        }

        fn build(self) -> CascadeRunner {
            CascadeRunner::new(
                Arc::new(self.connections),
                Arc::new(self.ranker),
                Arc::new(HealthTracker::new(Arc::new(self.health))),
                Dependents {
                    namespaces: Arc::new(self.namespaces),
                    deployments: Arc::new(self.deployments),
                    pods: Arc::new(self.pods),
                    nodes: Arc::new(self.nodes),
                    network_entities: Arc::new(self.network_entities),
                    network_baselines: Arc::new(self.network_baselines),
                    secrets: Arc::new(self.secrets),
                    alerts: Arc::new(self.alerts),
                    notifier: Arc::new(self.notifier),
                },
                self.timeout,
            )
        }
    }

    fn removed_cluster() -> Cluster {
        let mut cluster = Cluster::named("prod");
        cluster.id = "c1".to_string();
        cluster
    }

    #[tokio::test]
    async fn test_clean_cascade_removes_everything() {
        let mut parts = Parts::new();
        parts.namespaces = holding(&["ns-1", "ns-2"]);
        parts.namespaces.expect_remove().times(2).returning(|_, _, _| Ok(()));
        parts.secrets = holding(&["s-1"]);
        parts.secrets.expect_remove().times(1).returning(|_, _, _| Ok(()));
        parts.ranker = MockRanker::new();
        parts.ranker.expect_remove().withf(|id| id == "c1").times(1).returning(|_| ());

        let report = parts.build().run(&removed_cluster()).await;

        assert!(report.is_clean());
        assert_eq!(report.connection, ConnectionOutcome::NotConnected);
        assert_eq!(report.removed_from(Subsystem::Namespaces), 2);
        assert_eq!(report.removed_from(Subsystem::Secrets), 1);
        assert_eq!(report.removed_from(Subsystem::Pods), 0);
    }

    #[tokio::test]
    async fn test_every_subsystem_failing_still_completes() {
        let mut parts = Parts::new();
        parts.health = MockHealthStore::new();
        parts
            .health
            .expect_delete()
            .returning(|_| Err(Error::dependency("health-store", "down")));
        parts.namespaces = failing();
        parts.deployments = failing();
        parts.pods = failing();
        parts.nodes = failing();
        parts.network_entities = failing();
        parts.network_baselines = failing();
        parts.secrets = failing();

        let report = parts.build().run(&removed_cluster()).await;

        assert_eq!(report.failures.len(), 8);
        for subsystem in [
            Subsystem::Health,
            Subsystem::Namespaces,
            Subsystem::Deployments,
            Subsystem::Pods,
            Subsystem::Nodes,
            Subsystem::NetworkEntities,
            Subsystem::NetworkBaselines,
            Subsystem::Secrets,
        ] {
            assert_eq!(report.failures_for(subsystem).count(), 1, "{subsystem}");
        }
    }

    #[tokio::test]
    async fn test_single_item_failure_does_not_stop_subsystem() {
        let mut parts = Parts::new();
        parts.pods = holding(&["p-1", "p-2", "p-3"]);
        parts.pods.expect_remove().returning(|_, _, id| {
            if id == "p-2" {
                Err(Error::dependency("pod-store", "locked"))
            } else {
                Ok(())
            }
        });

        let report = parts.build().run(&removed_cluster()).await;

        assert_eq!(report.removed_from(Subsystem::Pods), 2);
        let failure = report.failures_for(Subsystem::Pods).next().unwrap();
        assert_eq!(failure.resource_id.as_deref(), Some("p-2"));
    }

    #[tokio::test]
    async fn test_deployment_alerts_resolved_and_notified() {
        let mut parts = Parts::new();
        parts.deployments = holding(&["d-1"]);
        parts.deployments.expect_remove().times(1).returning(|_, _, _| Ok(()));
        parts.alerts.expect_search_active_by_deployment().returning(|_, dep| {
            Ok(["a-1", "a-2", "a-3"]
                .iter()
                .map(|id| Alert {
                    id: id.to_string(),
                    deployment_id: dep.to_string(),
                    ..Default::default()
                })
                .collect())
        });
        parts.alerts.expect_mark_stale().returning(|_, id| {
            if id == "a-1" {
                Err(Error::dependency("alert-store", "conflict"))
            } else {
                Ok(())
            }
        });
        // Alerts after a failed one are still notified
        parts
            .notifier
            .expect_process_alert()
            .withf(|_, alert| alert.state == ViolationState::Resolved && alert.id != "a-1")
            .times(2)
            .returning(|_, _| ());

        let report = parts.build().run(&removed_cluster()).await;

        assert_eq!(report.removed_from(Subsystem::Deployments), 1);
        assert_eq!(report.removed_from(Subsystem::Alerts), 2);
        let failures: Vec<_> = report.failures_for(Subsystem::Alerts).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].resource_id.as_deref(), Some("a-1"));
    }

    #[tokio::test]
    async fn test_alert_search_failure_still_removes_deployment() {
        let mut parts = Parts::new();
        parts.deployments = holding(&["d-1"]);
        parts.deployments.expect_remove().times(1).returning(|_, _, _| Ok(()));
        parts
            .alerts
            .expect_search_active_by_deployment()
            .returning(|_, _| Err(Error::dependency("alert-store", "down")));

        let report = parts.build().run(&removed_cluster()).await;

        assert_eq!(report.removed_from(Subsystem::Deployments), 1);
        let failure = report.failures_for(Subsystem::Alerts).next().unwrap();
        assert_eq!(failure.resource_id.as_deref(), Some("d-1"));
    }

    #[tokio::test]
    async fn test_live_connection_terminated_and_awaited() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Arc::new(AgentConnection::new("c1".to_string(), "4.5".to_string(), tx));
        let watcher = Arc::clone(&conn);
        tokio::spawn(async move {
            let mut termination = watcher.subscribe_termination();
            let _ = termination.wait_for(|r| r.is_some()).await;
            watcher.mark_stopped();
        });

        let mut parts = Parts::new();
        parts.connections = MockConnectionManager::new();
        let handle: Arc<dyn AgentConnectionHandle> = conn.clone();
        parts
            .connections
            .expect_get_connection()
            .returning(move |_| Some(Arc::clone(&handle)));

        let report = parts.build().run(&removed_cluster()).await;

        assert_eq!(report.connection, ConnectionOutcome::Stopped);
        assert_eq!(conn.terminated().as_deref(), Some(TERMINATION_REASON));
    }

    #[tokio::test]
    async fn test_stuck_connection_times_out_without_failure() {
        let (tx, _rx) = mpsc::channel(1);
        let conn: Arc<dyn AgentConnectionHandle> =
            Arc::new(AgentConnection::new("c1".to_string(), "4.5".to_string(), tx));

        let mut parts = Parts::new();
        parts.timeout = Duration::from_millis(20);
        parts.connections = MockConnectionManager::new();
        parts
            .connections
            .expect_get_connection()
            .returning(move |_| Some(Arc::clone(&conn)));

        let report = parts.build().run(&removed_cluster()).await;

        assert_eq!(report.connection, ConnectionOutcome::TimedOut);
        assert!(report.is_clean());
        assert!(report.failure_counts().is_empty());
    }

    #[tokio::test]
    async fn test_worker_signals_completion_once_drained() {
        let worker = CascadeWorker::spawn(Arc::new(Parts::new().build()), 4);
        let (done_tx, done_rx) = oneshot::channel();

        worker.submit(CascadeJob {
            cluster: removed_cluster(),
            done: Some(done_tx),
        });
        let report = done_rx.await.unwrap();

        assert_eq!(report.cluster_id, "c1");
        assert_eq!(worker.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn test_worker_without_signal_still_runs() {
        let worker = CascadeWorker::spawn(Arc::new(Parts::new().build()), 1);
        for _ in 0..3 {
            worker.submit(CascadeJob {
                cluster: removed_cluster(),
                done: None,
            });
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while worker.pending_jobs() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("queue should drain");
    }
}
