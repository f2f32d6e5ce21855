//! The single write path for cluster records
//!
//! Every mutation goes through here so the store, the search index, and the
//! identity cache are updated together and in the same order. Callers hold
//! the registry write lock.

use std::sync::Arc;

use outpost_common::{Error, Result};

use crate::defaults::{normalize_cluster, validate_cluster};
use crate::identity::IdentityCache;
use crate::model::Cluster;
use crate::store::{ClusterStore, SearchIndex};

pub(crate) struct ClusterWriter {
    pub(crate) clusters: Arc<dyn ClusterStore>,
    pub(crate) index: Arc<dyn SearchIndex>,
    pub(crate) identity: Arc<IdentityCache>,
    default_admission_timeout_secs: i32,
}

impl ClusterWriter {
    pub(crate) fn new(
        clusters: Arc<dyn ClusterStore>,
        index: Arc<dyn SearchIndex>,
        identity: Arc<IdentityCache>,
        default_admission_timeout_secs: i32,
    ) -> Self {
        Self {
            clusters,
            index,
            identity,
            default_admission_timeout_secs,
        }
    }

    /// Normalise, validate, then store, cache and index the record
    ///
    /// The name is cached as soon as the record is stored, so an index
    /// failure still leaves it reserved.
    pub(crate) async fn upsert(&self, cluster: &mut Cluster) -> Result<()> {
        normalize_cluster(cluster, self.default_admission_timeout_secs)?;
        validate_cluster(cluster)?;

        self.clusters.upsert(cluster).await?;
        self.identity.insert(&cluster.id, &cluster.name);
        self.index.add_cluster(cluster).await?;
        Ok(())
    }

    /// Stored record, or `NotFound`
    pub(crate) async fn load(&self, id: &str) -> Result<Cluster> {
        self.clusters
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(id))
    }

    /// Delete the record and its cache entry
    ///
    /// The index entry is left to the caller, which still has work to hand
    /// off even when the index delete fails.
    pub(crate) async fn delete_record(&self, id: &str) -> Result<()> {
        self.clusters.delete(id).await?;
        self.identity.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockClusterStore, MockSearchIndex};
    use mockall::predicate::eq;

    fn writer(
        clusters: MockClusterStore,
        index: MockSearchIndex,
    ) -> (ClusterWriter, Arc<IdentityCache>) {
        let identity = Arc::new(IdentityCache::new());
        let writer = ClusterWriter::new(
            Arc::new(clusters),
            Arc::new(index),
            Arc::clone(&identity),
            3,
        );
        (writer, identity)
    }

    #[tokio::test]
    async fn test_upsert_normalizes_then_writes_everywhere() {
        let mut clusters = MockClusterStore::new();
        clusters
            .expect_upsert()
            .withf(|c| c.central_api_endpoint == "central:443" && c.runtime_support)
            .times(1)
            .returning(|_| Ok(()));
        let mut index = MockSearchIndex::new();
        index.expect_add_cluster().times(1).returning(|_| Ok(()));

        let (writer, identity) = writer(clusters, index);
        let mut cluster = Cluster::named("prod");
        cluster.id = "id-1".to_string();
        cluster.central_api_endpoint = "https://central:443".to_string();

        writer.upsert(&mut cluster).await.unwrap();
        assert_eq!(identity.id_for("prod").as_deref(), Some("id-1"));
    }

    #[tokio::test]
    async fn test_invalid_record_touches_nothing() {
        let mut clusters = MockClusterStore::new();
        clusters.expect_upsert().never();
        let mut index = MockSearchIndex::new();
        index.expect_add_cluster().never();

        let (writer, identity) = writer(clusters, index);
        let mut cluster = Cluster::named("prod");
        cluster.id = "id-1".to_string();
        cluster.main_image = "bad image".to_string();

        assert!(writer.upsert(&mut cluster).await.is_err());
        assert!(identity.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_skips_index_and_cache() {
        let mut clusters = MockClusterStore::new();
        clusters
            .expect_upsert()
            .returning(|_| Err(Error::dependency("cluster-store", "write failed")));
        let mut index = MockSearchIndex::new();
        index.expect_add_cluster().never();

        let (writer, identity) = writer(clusters, index);
        let mut cluster = Cluster::named("prod");
        cluster.id = "id-1".to_string();

        let err = writer.upsert(&mut cluster).await.unwrap_err();
        assert_eq!(err.context(), Some("cluster-store"));
        assert!(identity.is_empty());
    }

    #[tokio::test]
    async fn test_index_failure_still_reserves_name() {
        let mut clusters = MockClusterStore::new();
        clusters.expect_upsert().times(1).returning(|_| Ok(()));
        let mut index = MockSearchIndex::new();
        index
            .expect_add_cluster()
            .times(1)
            .returning(|_| Err(Error::dependency("search-index", "write failed")));

        let (writer, identity) = writer(clusters, index);
        let mut cluster = Cluster::named("dup");
        cluster.id = "id-1".to_string();

        let err = writer.upsert(&mut cluster).await.unwrap_err();
        assert_eq!(err.context(), Some("search-index"));
        assert_eq!(identity.id_for("dup").as_deref(), Some("id-1"));
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let mut clusters = MockClusterStore::new();
        clusters.expect_get().with(eq("gone")).returning(|_| Ok(None));

        let (writer, _) = writer(clusters, MockSearchIndex::new());
        assert!(writer.load("gone").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_record_clears_cache() {
        let mut clusters = MockClusterStore::new();
        clusters.expect_delete().times(1).returning(|_| Ok(()));
        let mut index = MockSearchIndex::new();
        index.expect_delete_cluster().never();

        let (writer, identity) = writer(clusters, index);
        identity.insert("id-1", "prod");

        writer.delete_record("id-1").await.unwrap();
        assert!(!identity.contains_id("id-1"));
        assert!(identity.id_for("prod").is_none());
    }

    #[tokio::test]
    async fn test_store_delete_failure_keeps_cache() {
        let mut clusters = MockClusterStore::new();
        clusters
            .expect_delete()
            .returning(|_| Err(Error::dependency("cluster-store", "down")));
        let mut index = MockSearchIndex::new();
        index.expect_delete_cluster().never();

        let (writer, identity) = writer(clusters, index);
        identity.insert("id-1", "prod");

        assert!(writer.delete_record("id-1").await.is_err());
        assert!(identity.contains_id("id-1"));
    }
}
