//! Storage, index, and ranking contracts
//!
//! The registry only talks to persistence and lookup through these traits.
//! Implementations report failures as `Error::Dependency`; the registry
//! surfaces them unchanged on synchronous paths.

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use outpost_common::Result;

use crate::model::{Cluster, HealthLevel, HealthStatus};

/// Primary store for cluster records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch a record by id
    async fn get(&self, id: &str) -> Result<Option<Cluster>>;

    /// Insert or replace a record
    async fn upsert(&self, cluster: &Cluster) -> Result<()>;

    /// Delete a record by id
    async fn delete(&self, id: &str) -> Result<()>;

    /// Return every stored record
    async fn walk(&self) -> Result<Vec<Cluster>>;

    /// Number of stored records
    async fn count(&self) -> Result<usize>;
}

/// Store for per-cluster health snapshots, keyed by cluster id
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthStore: Send + Sync {
    /// Fetch the snapshot for a cluster
    async fn get(&self, id: &str) -> Result<Option<HealthStatus>>;

    /// Fetch snapshots for `ids`
    ///
    /// Returns the found snapshots in request order, plus the (ascending)
    /// indexes into `ids` that had no snapshot.
    async fn get_many(&self, ids: &[String]) -> Result<(Vec<HealthStatus>, Vec<usize>)>;

    /// Insert or replace the snapshot for a cluster
    async fn upsert_with_id(&self, id: &str, status: &HealthStatus) -> Result<()>;

    /// Return every snapshot with its cluster id
    async fn walk_all_with_id(&self) -> Result<Vec<(String, HealthStatus)>>;

    /// Delete the snapshot for a cluster
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Search index over cluster records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Index (or re-index) one record
    async fn add_cluster(&self, cluster: &Cluster) -> Result<()>;

    /// Index many records
    async fn add_clusters(&self, clusters: &[Cluster]) -> Result<()>;

    /// Drop a record from the index
    async fn delete_cluster(&self, id: &str) -> Result<()>;

    /// Run a query
    async fn search(&self, query: &ClusterQuery) -> Result<Vec<SearchResult>>;
}

/// Priority ranking of clusters
#[cfg_attr(test, automock)]
pub trait Ranker: Send + Sync {
    /// Rank for a cluster; implementations return a default for unknown ids
    fn get_rank_for_id(&self, id: &str) -> i64;

    /// Forget a cluster
    fn remove(&self, id: &str);
}

/// Exact-match query over indexed clusters
///
/// All populated criteria must match. The default query matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterQuery {
    /// Restrict to these ids
    pub cluster_ids: Vec<String>,
    /// Restrict to this name
    pub name: Option<String>,
    /// Restrict to clusters carrying all these labels
    pub labels: BTreeMap<String, String>,
    /// Restrict to this sensor health
    pub sensor_health: Option<HealthLevel>,
}

impl ClusterQuery {
    /// Query matching every cluster
    pub fn all() -> Self {
        Self::default()
    }

    /// Query by exact name
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Add a label criterion
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Whether the query has no criteria
    pub fn is_match_all(&self) -> bool {
        self == &Self::default()
    }

    /// Evaluate the query against a record
    pub fn matches(&self, cluster: &Cluster) -> bool {
        if !self.cluster_ids.is_empty() && !self.cluster_ids.contains(&cluster.id) {
            return false;
        }
        if let Some(name) = &self.name {
            if name != &cluster.name {
                return false;
            }
        }
        if !self
            .labels
            .iter()
            .all(|(k, v)| cluster.labels.get(k) == Some(v))
        {
            return false;
        }
        if let Some(level) = self.sensor_health {
            let actual = cluster
                .health_status
                .as_ref()
                .and_then(|h| h.sensor_health_status);
            if actual != Some(level) {
                return false;
            }
        }
        true
    }
}

/// One search hit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchResult {
    /// Cluster id
    pub id: String,
    /// Cluster name
    pub name: String,
}
