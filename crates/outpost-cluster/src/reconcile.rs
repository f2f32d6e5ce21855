//! Create, adopt, or reject a cluster from an agent announcement
//!
//! An agent announces itself with an optional cluster id and an optional
//! declarative configuration block. The engine resolves the announcement to
//! a record, creating one when the name is new, and converges the record's
//! declarative fields onto the announced configuration.
//!
//! Adopting an existing cluster is guarded against hijacking: while the
//! previous agent was seen recently, a new agent has to come from the same
//! physical cluster.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::MutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use outpost_common::metrics::{self, ReconcileOutcome};
use outpost_common::{Error, Result};

use crate::access::AccessScope;
use crate::connection::{ConnectionContinuity, ContinuityError};
use crate::defaults::configure_from_managed;
use crate::dependents::FlowStoreProvisioner;
use crate::health::HealthTracker;
use crate::model::{Cluster, RegistrationAnnouncement, SensorIdentification};
use crate::persist::ClusterWriter;

/// Record produced by reconciliation, with what happened to it
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Reconciled {
    pub(crate) cluster: Cluster,
    pub(crate) outcome: ReconcileOutcome,
}

pub(crate) struct ReconciliationEngine {
    writer: Arc<ClusterWriter>,
    health: Arc<HealthTracker>,
    continuity: Arc<dyn ConnectionContinuity>,
    flows: Arc<dyn FlowStoreProvisioner>,
    grace_period: Duration,
}

impl ReconciliationEngine {
    pub(crate) fn new(
        writer: Arc<ClusterWriter>,
        health: Arc<HealthTracker>,
        continuity: Arc<dyn ConnectionContinuity>,
        flows: Arc<dyn FlowStoreProvisioner>,
        grace_period: Duration,
    ) -> Self {
        Self {
            writer,
            health,
            continuity,
            flows,
            grace_period,
        }
    }

    /// Resolve `announcement` to a cluster record
    ///
    /// `now` is the time the announcement is evaluated at; the grace window
    /// is measured from the last contact up to it.
    pub(crate) async fn reconcile(
        &self,
        guard: &MutexGuard<'_, ()>,
        announcement: &RegistrationAnnouncement,
        now: DateTime<Utc>,
    ) -> Result<Reconciled> {
        let name = announcement.cluster_name();
        let id = announcement
            .cluster_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| {
                (!name.is_empty())
                    .then(|| self.writer.identity.id_for(name))
                    .flatten()
            });

        let result = match id {
            Some(id) => self.adopt(&id, announcement, now).await,
            None if !name.is_empty() => self.create(guard, announcement).await,
            None => Err(Error::validation(
                "neither a cluster id nor a cluster name was announced",
            )),
        };

        match &result {
            Ok(reconciled) => {
                metrics::record_reconcile(reconciled.outcome);
                info!(
                    cluster = %reconciled.cluster.id,
                    name = %reconciled.cluster.name,
                    outcome = reconciled.outcome.as_str(),
                    "Reconciled cluster announcement"
                );
            }
            Err(e) => {
                metrics::record_reconcile(ReconcileOutcome::Rejected);
                warn!(name = %name, error = %e, "Rejected cluster announcement");
            }
        }
        result
    }

    /// Allocate an id for a new record and persist it
    ///
    /// A flow store provisioning failure is reported, but the record has
    /// already been written and stays.
    pub(crate) async fn admit(
        &self,
        _guard: &MutexGuard<'_, ()>,
        cluster: &mut Cluster,
    ) -> Result<()> {
        if !cluster.id.is_empty() {
            return Err(Error::validation_for_field(
                &cluster.id,
                "id",
                "id may not be set when creating a cluster",
            ));
        }
        if cluster.name.is_empty() {
            return Err(Error::validation_for_field(
                "",
                "name",
                "cluster name must not be empty",
            ));
        }
        if let Some(existing) = self.writer.identity.id_for(&cluster.name) {
            return Err(Error::conflict(
                &cluster.name,
                format!("name already in use by cluster {existing}"),
            ));
        }

        cluster.id = Uuid::new_v4().to_string();
        self.writer.upsert(cluster).await?;

        self.flows
            .create_flow_store(&AccessScope::all_access(), &cluster.id)
            .await
            .map_err(|e| {
                Error::dependency(
                    "flow-store",
                    format!("cluster {} created but flow store failed: {e}", cluster.id),
                )
            })
    }

    async fn create(
        &self,
        guard: &MutexGuard<'_, ()>,
        announcement: &RegistrationAnnouncement,
    ) -> Result<Reconciled> {
        let mut cluster = Cluster::named(announcement.cluster_name());
        cluster.most_recent_sensor_id = announcement.identification.clone();

        if let Some(config) = announcement
            .managed_config_init
            .as_ref()
            .and_then(|init| init.cluster_config.as_ref())
        {
            configure_from_managed(&mut cluster, config);
        }
        cluster.managed_config = announcement.managed_config().cloned();

        self.admit(guard, &mut cluster).await?;
        Ok(Reconciled {
            cluster,
            outcome: ReconcileOutcome::Created,
        })
    }

    async fn adopt(
        &self,
        id: &str,
        announcement: &RegistrationAnnouncement,
        now: DateTime<Utc>,
    ) -> Result<Reconciled> {
        let mut cluster = self.writer.load(id).await?;

        let name = announcement.cluster_name();
        if !name.is_empty() && name != cluster.name {
            return Err(Error::conflict(
                &cluster.name,
                format!(
                    "name mismatch for cluster {id}: expected {:?}, but {name:?} was announced",
                    cluster.name
                ),
            ));
        }

        self.check_replacement(&cluster, announcement.identification.as_ref(), now)
            .await?;

        let Some(config) = announcement.managed_config() else {
            if cluster.managed_config.take().is_some() {
                self.writer.upsert(&mut cluster).await?;
                return Ok(Reconciled {
                    cluster,
                    outcome: ReconcileOutcome::Cleared,
                });
            }
            return Ok(Reconciled {
                cluster,
                outcome: ReconcileOutcome::Adopted,
            });
        };

        if cluster.config_fingerprint() == Some(config.config_fingerprint.as_str()) {
            debug!(cluster = %id, "Configuration fingerprint unchanged");
            return Ok(Reconciled {
                cluster,
                outcome: ReconcileOutcome::Unchanged,
            });
        }

        configure_from_managed(&mut cluster, config);
        cluster.managed_config = Some(config.clone());
        self.writer.upsert(&mut cluster).await?;
        Ok(Reconciled {
            cluster,
            outcome: ReconcileOutcome::Updated,
        })
    }

    /// Enforce the grace window after the previous agent's last contact
    async fn check_replacement(
        &self,
        cluster: &Cluster,
        incoming: Option<&SensorIdentification>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(last_contact) = self.health.last_contact(&cluster.id).await? else {
            return Ok(());
        };
        let Some(stored) = cluster.most_recent_sensor_id.as_ref() else {
            return Ok(());
        };

        // Contact in the future (clock skew) counts as just now
        let elapsed = (now - last_contact).to_std().unwrap_or(Duration::ZERO);
        let Some(remaining) = self.grace_period.checked_sub(elapsed).filter(|r| !r.is_zero())
        else {
            return Ok(());
        };

        let verdict = match incoming {
            Some(incoming) => self.continuity.check_replace(incoming, stored),
            None => Err(ContinuityError::Missing),
        };
        verdict.map_err(|e| {
            let wait_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            Error::conflict(
                &cluster.name,
                format!(
                    "registering a new sensor is not allowed: {e}; \
                     if you recently re-deployed, please wait for another {wait_secs}s"
                ),
            )
        })
    }
}
