//! Cluster resource model
//!
//! The `Cluster` record is owned by the registry. Health and priority are
//! derived: they are attached on read and never written back with the record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How runtime data is collected on the cluster's nodes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionMethod {
    /// Not specified; normalised to `KernelModule`
    #[default]
    UnsetCollection,
    /// Runtime collection disabled
    NoCollection,
    /// Legacy kernel module probe
    KernelModule,
    /// eBPF probe
    Ebpf,
    /// CO-RE eBPF probe
    CoreBpf,
}

/// Orchestrator flavour of the monitored cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterType {
    /// Unknown or generic cluster
    #[default]
    GenericCluster,
    /// Upstream Kubernetes
    KubernetesCluster,
    /// OpenShift 3.x
    OpenshiftCluster,
    /// OpenShift 4.x
    Openshift4Cluster,
}

impl ClusterType {
    /// Whether API server audit log collection is available for this type
    pub fn supports_audit_logs(&self) -> bool {
        matches!(self, Self::Openshift4Cluster)
    }
}

/// Admission controller settings pushed to the agent
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionControllerConfig {
    /// Whether the admission controller enforces policies
    pub enabled: bool,
    /// Seconds the admission controller may spend on a request; 0 means default
    pub timeout_seconds: i32,
    /// Scan images inline during admission
    pub scan_inline: bool,
    /// Disallow the bypass annotation
    pub disable_bypass: bool,
    /// Enforce on object updates as well as creates
    pub enforce_on_updates: bool,
}

/// Configuration that can change without redeploying the agent
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicConfig {
    /// Admission controller settings
    pub admission_controller_config: Option<AdmissionControllerConfig>,
    /// Registry override for image pulls
    pub registry_override: String,
    /// Turn off audit log collection
    pub disable_audit_logs: bool,
}

/// Taint toleration settings for collector pods
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TolerationsConfig {
    /// When true, collectors do not tolerate taints
    pub disabled: bool,
}

/// Deploy-time settings from a declarative configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticConfig {
    /// Orchestrator flavour
    pub cluster_type: ClusterType,
    /// Agent image reference
    pub main_image: String,
    /// Endpoint the agent uses to reach the control plane
    pub central_api_endpoint: String,
    /// Runtime collection method
    pub collection_method: CollectionMethod,
    /// Collector image reference
    pub collector_image: String,
    /// Deploy the admission controller
    pub admission_controller: bool,
    /// Admission controller listens on updates
    pub admission_controller_updates: bool,
    /// Admission controller listens on events
    pub admission_controller_events: bool,
    /// Toleration settings
    pub tolerations_config: Option<TolerationsConfig>,
    /// Use the slim collector image
    pub slim_collector: bool,
}

/// Full declarative configuration, identified by its fingerprint
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteClusterConfig {
    /// Dynamic portion
    pub dynamic_config: Option<DynamicConfig>,
    /// Static portion
    pub static_config: StaticConfig,
    /// Labels attached to the cluster
    pub cluster_labels: BTreeMap<String, String>,
    /// Fingerprint used to skip re-applying an unchanged configuration
    pub config_fingerprint: String,
}

/// Identification a remote agent presents when it connects
///
/// Describes the physical cluster the agent runs in, so that a second
/// agent claiming the same logical cluster can be checked against it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorIdentification {
    /// UID of the kube-system namespace
    pub system_namespace_id: String,
    /// UID of the default namespace
    pub default_namespace_id: String,
    /// Namespace the agent is deployed in
    pub app_namespace: String,
    /// UID of the agent's namespace
    pub app_namespace_id: String,
    /// UID of the agent's service account
    pub app_serviceaccount_id: String,
    /// Node the agent pod runs on
    pub k8s_node_name: String,
}

/// Whether and how the agent can be upgraded
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Upgradability {
    /// Not yet determined
    #[default]
    Unset,
    /// Already on the latest version
    UpToDate,
    /// Must be upgraded by hand
    ManualUpgradeRequired,
    /// Can be upgraded automatically
    AutoUpgradePossible,
    /// Agent is newer than the control plane
    SensorVersionHigher,
}

/// Upgrade status of the cluster's agent
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterUpgradeStatus {
    /// Upgrade capability
    pub upgradability: Upgradability,
    /// Human-readable reason for the upgradability verdict
    pub upgradability_status_reason: String,
    /// Id of the most recent upgrade process, if any
    pub most_recent_process_id: Option<String>,
}

/// Agent certificate validity window
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCertExpiryStatus {
    /// Certificate expiry
    pub sensor_cert_expiry: Option<DateTime<Utc>>,
    /// Certificate start of validity
    pub sensor_cert_not_before: Option<DateTime<Utc>>,
}

/// Orchestrator facts reported by the agent
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorMetadata {
    /// Orchestrator version
    pub version: String,
    /// Build date of the orchestrator
    pub build_date: Option<DateTime<Utc>>,
    /// Served API versions
    pub api_versions: Vec<String>,
}

/// Status block of a cluster; each part is updated independently
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Agent version string
    pub sensor_version: String,
    /// Orchestrator facts
    pub orchestrator_metadata: Option<OrchestratorMetadata>,
    /// Upgrade status
    pub upgrade_status: Option<ClusterUpgradeStatus>,
    /// Certificate expiry status
    pub cert_expiry_status: Option<ClusterCertExpiryStatus>,
}

/// Health level of one component
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthLevel {
    /// Never reported
    #[default]
    Uninitialized,
    /// Component not reachable
    Unavailable,
    /// Component reports failures
    Unhealthy,
    /// Component partially working
    Degraded,
    /// Component working
    Healthy,
}

/// Collector rollout numbers
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorHealthInfo {
    /// Pods the daemon set wants
    pub total_desired_pods: i32,
    /// Pods ready
    pub total_ready_pods: i32,
    /// Errors collected while gathering the numbers
    pub status_errors: Vec<String>,
}

/// Per-cluster liveness snapshot
///
/// `None` fields in an incoming report mean "not reported this time" and
/// keep the previously stored value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Agent health
    pub sensor_health_status: Option<HealthLevel>,
    /// Collector health
    pub collector_health_status: Option<HealthLevel>,
    /// Admission control health
    pub admission_control_health_status: Option<HealthLevel>,
    /// Collector rollout numbers
    pub collector_health_info: Option<CollectorHealthInfo>,
    /// Last time the agent contacted the control plane
    pub last_contact: Option<DateTime<Utc>>,
}

/// Audit log collection position on one node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogFileState {
    /// Only events after this time are collected
    pub collect_logs_since: Option<DateTime<Utc>>,
    /// Id of the last event collected
    pub last_audit_id: String,
}

/// A registered, remotely-monitored environment
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Server-assigned id; empty until created
    pub id: String,
    /// Human-readable name; immutable after creation
    pub name: String,
    /// Orchestrator flavour
    pub cluster_type: ClusterType,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Agent image reference
    pub main_image: String,
    /// Collector image reference
    pub collector_image: String,
    /// Endpoint the agent uses to reach the control plane
    pub central_api_endpoint: String,
    /// Whether runtime data is collected (derived from `collection_method`)
    pub runtime_support: bool,
    /// Runtime collection method
    pub collection_method: CollectionMethod,
    /// Deploy the admission controller
    pub admission_controller: bool,
    /// Admission controller listens on updates
    pub admission_controller_updates: bool,
    /// Admission controller listens on events
    pub admission_controller_events: bool,
    /// Toleration settings
    pub tolerations_config: Option<TolerationsConfig>,
    /// Use the slim collector image
    pub slim_collector: bool,
    /// Configuration pushed to a live agent on update
    pub dynamic_config: Option<DynamicConfig>,
    /// Declarative configuration, present while the cluster is managed
    pub managed_config: Option<CompleteClusterConfig>,
    /// Identification of the most recent agent connection
    pub most_recent_sensor_id: Option<SensorIdentification>,
    /// Status block
    pub status: Option<ClusterStatus>,
    /// Per-node audit log collection state
    pub audit_log_state: BTreeMap<String, AuditLogFileState>,
    /// Health, attached on read
    #[serde(skip)]
    pub health_status: Option<HealthStatus>,
    /// Priority rank, attached on read
    #[serde(skip)]
    pub priority: i64,
}

impl Cluster {
    /// Create an unsaved cluster with the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Fingerprint of the stored declarative configuration, if managed
    pub fn config_fingerprint(&self) -> Option<&str> {
        self.managed_config
            .as_ref()
            .map(|c| c.config_fingerprint.as_str())
    }

    /// Whether the cluster is under declarative management
    pub fn is_managed(&self) -> bool {
        self.managed_config.is_some()
    }
}

/// Declarative portion of an agent announcement
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedConfigInit {
    /// Name the agent was configured with
    pub cluster_name: String,
    /// Configuration to apply, if any
    pub cluster_config: Option<CompleteClusterConfig>,
    /// The agent was deployed without declarative management
    pub not_managed: bool,
}

/// An agent announcing itself to the control plane
///
/// Not persisted; drives create/adopt/reject decisions on `Cluster`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationAnnouncement {
    /// Cluster id from the agent's credentials, if it has one
    pub cluster_id: Option<String>,
    /// Identification of the announcing agent
    pub identification: Option<SensorIdentification>,
    /// Declarative configuration block
    pub managed_config_init: Option<ManagedConfigInit>,
}

impl RegistrationAnnouncement {
    /// Name carried by the announcement, empty when absent
    pub fn cluster_name(&self) -> &str {
        self.managed_config_init
            .as_ref()
            .map(|i| i.cluster_name.as_str())
            .unwrap_or_default()
    }

    /// Declarative configuration to apply, when the announcement is managed
    ///
    /// An init block flagged `not_managed`, or one without a configuration,
    /// counts as unmanaged.
    pub fn managed_config(&self) -> Option<&CompleteClusterConfig> {
        self.managed_config_init
            .as_ref()
            .filter(|i| !i.not_managed)
            .and_then(|i| i.cluster_config.as_ref())
    }
}
