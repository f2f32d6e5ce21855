//! Error types for the Outpost control plane
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the cluster it concerns (when one is known) so that
//! callers can log or surface it without re-parsing the message.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for cluster lifecycle operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed or missing input, rejected before any mutation
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Cluster id or name the input refers to
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path, e.g. "dynamic_config.admission_controller_config"
        field: Option<String>,
    },

    /// The caller's access scope does not allow the operation
    #[error("access denied to {resource} for cluster {cluster}")]
    AccessDenied {
        /// Resource kind being accessed
        resource: String,
        /// Cluster the access check was scoped to
        cluster: String,
    },

    /// The referenced cluster does not exist
    #[error("cluster {cluster} not found")]
    NotFound {
        /// Id or name of the missing cluster
        cluster: String,
    },

    /// Naming conflict or a rejected replacement registration
    #[error("conflict for cluster {cluster}: {message}")]
    Conflict {
        /// Cluster the conflict concerns
        cluster: String,
        /// Description of the conflict
        message: String,
    },

    /// A downstream collaborator failed on a synchronous path
    #[error("dependency error [{context}]: {message}")]
    Dependency {
        /// Collaborator that failed (e.g., "cluster-store", "search-index")
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an access-denied error for the cluster resource
    pub fn access_denied(cluster: impl Into<String>) -> Self {
        Self::AccessDenied {
            resource: "Cluster".to_string(),
            cluster: cluster.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(cluster: impl Into<String>) -> Self {
        Self::NotFound {
            cluster: cluster.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a dependency error for the named collaborator
    pub fn dependency(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Dependency {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, access and conflict errors need the caller to change the
    /// request. Collaborator failures may clear up on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Validation { .. } => false,
            Error::AccessDenied { .. } => false,
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => false,
            Error::Dependency { .. } => true,
        }
    }

    /// Get the cluster if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::AccessDenied { cluster, .. } => Some(cluster),
            Error::NotFound { cluster } => Some(cluster),
            Error::Conflict { cluster, .. } => Some(cluster),
            Error::Dependency { .. } => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Dependency { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Whether this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether this is a conflict error
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation in Cluster Lifecycle Operations
    // ==========================================================================

    /// Story: a naming conflict names both clusters so the operator can fix
    /// their agent configuration without digging through logs
    #[test]
    fn story_conflict_surfaces_both_names() {
        let err = Error::conflict(
            "0b6f",
            "name mismatch: expected \"prod-east\", but \"prod-west\" was specified",
        );
        let msg = err.to_string();
        assert!(msg.contains("prod-east"));
        assert!(msg.contains("prod-west"));
        assert!(err.is_conflict());
        assert!(!err.is_retryable());
    }

    /// Story: validation errors point at the offending field
    #[test]
    fn story_validation_carries_field_path() {
        let err = Error::validation_for_field(
            "edge-1",
            "dynamic_config.admission_controller_config.timeout_seconds",
            "timeout of -1 is invalid",
        );
        match &err {
            Error::Validation { field, cluster, .. } => {
                assert_eq!(
                    field.as_deref(),
                    Some("dynamic_config.admission_controller_config.timeout_seconds")
                );
                assert_eq!(cluster, "edge-1");
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(err.to_string().contains("timeout of -1"));
    }

    /// Story: collaborator failures are retryable, caller mistakes are not
    #[test]
    fn story_error_retryability() {
        assert!(!Error::validation("bad name").is_retryable());
        assert!(!Error::access_denied("c1").is_retryable());
        assert!(!Error::not_found("c1").is_retryable());
        assert!(Error::dependency("cluster-store", "io timeout").is_retryable());
    }

    #[test]
    fn test_cluster_accessor() {
        assert_eq!(Error::not_found("c1").cluster(), Some("c1"));
        assert_eq!(Error::access_denied("c2").cluster(), Some("c2"));
        assert_eq!(Error::conflict("c3", "x").cluster(), Some("c3"));
        assert_eq!(Error::dependency("index", "x").cluster(), None);
    }

    #[test]
    fn test_context_accessor() {
        let err = Error::dependency("search-index", "unavailable");
        assert_eq!(err.context(), Some("search-index"));
        assert!(err.to_string().contains("[search-index]"));

        assert_eq!(Error::conflict("c1", "taken").context(), None);
    }

    #[test]
    fn test_validation_uses_unknown_context() {
        match Error::validation("test") {
            Error::Validation { cluster, field, .. } => {
                assert_eq!(cluster, UNKNOWN_CONTEXT);
                assert!(field.is_none());
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(Error::not_found("gone").is_not_found());
        assert!(!Error::conflict("c", "m").is_not_found());
    }
}
