//! Cluster health tracking
//!
//! Health lives in its own store, keyed by cluster id, and is merged into
//! cluster records on read. Reports are partial: absent fields keep their
//! stored value.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use outpost_common::Result;

use crate::model::{Cluster, HealthStatus};
use crate::store::HealthStore;

impl HealthStatus {
    /// Overlay the fields reported in `incoming`
    pub fn merge(&mut self, incoming: &HealthStatus) {
        if incoming.sensor_health_status.is_some() {
            self.sensor_health_status = incoming.sensor_health_status;
        }
        if incoming.collector_health_status.is_some() {
            self.collector_health_status = incoming.collector_health_status;
        }
        if incoming.admission_control_health_status.is_some() {
            self.admission_control_health_status = incoming.admission_control_health_status;
        }
        if incoming.collector_health_info.is_some() {
            self.collector_health_info = incoming.collector_health_info.clone();
        }
        if incoming.last_contact.is_some() {
            self.last_contact = incoming.last_contact;
        }
    }
}

/// Result of recording a health report
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthUpdate {
    /// Snapshot after the merge
    pub status: HealthStatus,
    /// Sensor or collector health level changed; the index needs refreshing
    pub liveness_changed: bool,
}

/// Reads and writes per-cluster health snapshots
pub struct HealthTracker {
    store: Arc<dyn HealthStore>,
}

impl HealthTracker {
    /// Create a tracker over `store`
    pub fn new(store: Arc<dyn HealthStore>) -> Self {
        Self { store }
    }

    /// Merge a report into the stored snapshot and persist it
    pub async fn record(&self, cluster_id: &str, incoming: &HealthStatus) -> Result<HealthUpdate> {
        let previous = self.store.get(cluster_id).await?.unwrap_or_default();

        let mut status = previous.clone();
        status.merge(incoming);
        self.store.upsert_with_id(cluster_id, &status).await?;

        let liveness_changed = previous.sensor_health_status != status.sensor_health_status
            || previous.collector_health_status != status.collector_health_status;
        if liveness_changed {
            debug!(
                cluster = %cluster_id,
                sensor = ?status.sensor_health_status,
                collector = ?status.collector_health_status,
                "Cluster liveness changed"
            );
        }

        Ok(HealthUpdate {
            status,
            liveness_changed,
        })
    }

    /// Snapshot for one cluster
    pub async fn get(&self, cluster_id: &str) -> Result<Option<HealthStatus>> {
        self.store.get(cluster_id).await
    }

    /// Last time the cluster's agent made contact
    pub async fn last_contact(&self, cluster_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .get(cluster_id)
            .await?
            .and_then(|h| h.last_contact))
    }

    /// Attach stored health to each cluster
    ///
    /// Best effort: a store failure is logged and leaves the clusters
    /// without health rather than failing the read.
    pub async fn populate(&self, clusters: &mut [Cluster]) {
        if clusters.is_empty() {
            return;
        }
        let ids: Vec<String> = clusters.iter().map(|c| c.id.clone()).collect();
        let (found, missing) = match self.store.get_many(&ids).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Failed to fetch cluster health");
                return;
            }
        };

        let mut found = found.into_iter();
        let mut missing = missing.into_iter().peekable();
        for (i, cluster) in clusters.iter_mut().enumerate() {
            if missing.peek() == Some(&i) {
                missing.next();
                cluster.health_status = None;
                continue;
            }
            cluster.health_status = found.next();
        }
    }

    /// Every stored snapshot with its cluster id
    pub async fn load_all(&self) -> Result<Vec<(String, HealthStatus)>> {
        self.store.walk_all_with_id().await
    }

    /// Drop the snapshot for a cluster
    pub async fn forget(&self, cluster_id: &str) -> Result<()> {
        self.store.delete(cluster_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HealthLevel;
    use crate::store::MockHealthStore;
    use chrono::TimeZone;
    use mockall::predicate::eq;
    use outpost_common::Error;

    fn healthy_sensor() -> HealthStatus {
        HealthStatus {
            sensor_health_status: Some(HealthLevel::Healthy),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_keeps_unreported_fields() {
        let contact = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut stored = HealthStatus {
            sensor_health_status: Some(HealthLevel::Healthy),
            collector_health_status: Some(HealthLevel::Degraded),
            last_contact: Some(contact),
            ..Default::default()
        };
        stored.merge(&HealthStatus {
            collector_health_status: Some(HealthLevel::Healthy),
            ..Default::default()
        });

        assert_eq!(stored.sensor_health_status, Some(HealthLevel::Healthy));
        assert_eq!(stored.collector_health_status, Some(HealthLevel::Healthy));
        assert_eq!(stored.last_contact, Some(contact));
    }

    #[tokio::test]
    async fn test_record_reports_liveness_change() {
        let mut store = MockHealthStore::new();
        store.expect_get().with(eq("c1")).returning(|_| Ok(None));
        store
            .expect_upsert_with_id()
            .withf(|id, status| {
                id == "c1" && status.sensor_health_status == Some(HealthLevel::Healthy)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let tracker = HealthTracker::new(Arc::new(store));
        let update = tracker.record("c1", &healthy_sensor()).await.unwrap();
        assert!(update.liveness_changed);
    }

    #[tokio::test]
    async fn test_record_contact_only_is_not_liveness_change() {
        let mut store = MockHealthStore::new();
        store
            .expect_get()
            .returning(|_| Ok(Some(healthy_sensor())));
        store.expect_upsert_with_id().returning(|_, _| Ok(()));

        let tracker = HealthTracker::new(Arc::new(store));
        let update = tracker
            .record(
                "c1",
                &HealthStatus {
                    last_contact: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!update.liveness_changed);
        assert_eq!(
            update.status.sensor_health_status,
            Some(HealthLevel::Healthy)
        );
    }

    #[tokio::test]
    async fn test_record_propagates_store_failure() {
        let mut store = MockHealthStore::new();
        store
            .expect_get()
            .returning(|_| Err(Error::dependency("health-store", "unavailable")));

        let tracker = HealthTracker::new(Arc::new(store));
        let err = tracker.record("c1", &healthy_sensor()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_populate_aligns_missing_indexes() {
        let mut store = MockHealthStore::new();
        store
            .expect_get_many()
            .returning(|_| Ok((vec![healthy_sensor()], vec![0, 2])));

        let tracker = HealthTracker::new(Arc::new(store));
        let mut clusters = vec![
            Cluster::named("a"),
            Cluster::named("b"),
            Cluster::named("c"),
        ];
        tracker.populate(&mut clusters).await;

        assert!(clusters[0].health_status.is_none());
        assert_eq!(clusters[1].health_status, Some(healthy_sensor()));
        assert!(clusters[2].health_status.is_none());
    }

    #[tokio::test]
    async fn test_populate_tolerates_store_failure() {
        let mut store = MockHealthStore::new();
        store
            .expect_get_many()
            .returning(|_| Err(Error::dependency("health-store", "timeout")));

        let tracker = HealthTracker::new(Arc::new(store));
        let mut clusters = vec![Cluster::named("a")];
        tracker.populate(&mut clusters).await;
        assert!(clusters[0].health_status.is_none());
    }

    #[tokio::test]
    async fn test_last_contact() {
        let contact = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut store = MockHealthStore::new();
        store.expect_get().returning(move |_| {
            Ok(Some(HealthStatus {
                last_contact: Some(contact),
                ..Default::default()
            }))
        });

        let tracker = HealthTracker::new(Arc::new(store));
        assert_eq!(tracker.last_contact("c1").await.unwrap(), Some(contact));
    }
}
