//! Access scopes and the access-check contract
//!
//! Policy evaluation is external. The registry only asks whether a scope may
//! read or write clusters, either one specific cluster or all of them.

use outpost_common::Result;

/// Identity a request is evaluated under
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessScope {
    subject: String,
    all_access: bool,
}

impl AccessScope {
    /// Scope for an interactive caller
    pub fn for_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            all_access: false,
        }
    }

    /// Elevated scope used by internal background work
    pub fn all_access() -> Self {
        Self {
            subject: "system".to_string(),
            all_access: true,
        }
    }

    /// Subject name
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Whether this scope bypasses policy
    pub fn is_all_access(&self) -> bool {
        self.all_access
    }
}

/// Access decision for the cluster resource
///
/// `cluster_id = None` asks about every cluster at once. A `false` answer
/// there may still leave access to individual clusters.
pub trait AccessChecker: Send + Sync {
    /// May `scope` read the cluster (or all clusters)?
    fn read_allowed(&self, scope: &AccessScope, cluster_id: Option<&str>) -> Result<bool>;

    /// May `scope` write the cluster (or all clusters)?
    fn write_allowed(&self, scope: &AccessScope, cluster_id: Option<&str>) -> Result<bool>;
}
