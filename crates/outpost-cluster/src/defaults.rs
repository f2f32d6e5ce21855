//! Normalisation and validation applied before every cluster write

use outpost_common::{Error, Result};

use crate::model::{
    AdmissionControllerConfig, Cluster, CollectionMethod, CompleteClusterConfig, DynamicConfig,
    TolerationsConfig,
};

const ENDPOINT_SCHEMES: [&str; 2] = ["https://", "http://"];

/// Fill defaults and derived fields in place
///
/// `default_admission_timeout_secs` replaces an admission timeout of 0.
/// A negative timeout is rejected.
pub fn normalize_cluster(cluster: &mut Cluster, default_admission_timeout_secs: i32) -> Result<()> {
    for scheme in ENDPOINT_SCHEMES {
        if let Some(rest) = cluster.central_api_endpoint.strip_prefix(scheme) {
            cluster.central_api_endpoint = rest.to_string();
            break;
        }
    }

    if cluster.collection_method == CollectionMethod::UnsetCollection {
        cluster.collection_method = CollectionMethod::KernelModule;
    }
    cluster.runtime_support = cluster.collection_method != CollectionMethod::NoCollection;

    if cluster.tolerations_config.is_none() {
        cluster.tolerations_config = Some(TolerationsConfig { disabled: false });
    }

    let cluster_type = cluster.cluster_type;
    let dynamic = cluster.dynamic_config.get_or_insert_with(DynamicConfig::default);
    if !cluster_type.supports_audit_logs() {
        dynamic.disable_audit_logs = true;
    }

    let admission = dynamic
        .admission_controller_config
        .get_or_insert_with(AdmissionControllerConfig::default);
    if admission.timeout_seconds < 0 {
        return Err(Error::validation_for_field(
            &cluster.name,
            "dynamic_config.admission_controller_config.timeout_seconds",
            format!(
                "admission controller timeout must be non-negative, got {}",
                admission.timeout_seconds
            ),
        ));
    }
    if admission.timeout_seconds == 0 {
        admission.timeout_seconds = default_admission_timeout_secs;
    }

    Ok(())
}

/// Reject records that may not be stored
pub fn validate_cluster(cluster: &Cluster) -> Result<()> {
    if cluster.name.trim().is_empty() {
        return Err(Error::validation_for_field(
            &cluster.name,
            "name",
            "cluster name must not be empty",
        ));
    }
    if cluster.main_image.chars().any(char::is_whitespace) {
        return Err(Error::validation_for_field(
            &cluster.name,
            "main_image",
            format!("invalid main image {:?}", cluster.main_image),
        ));
    }
    Ok(())
}

/// Copy a declarative configuration onto the record
///
/// Only the configuration-owned fields are touched; identity, status, and
/// audit state are left alone.
pub fn configure_from_managed(cluster: &mut Cluster, config: &CompleteClusterConfig) {
    let stat = &config.static_config;

    cluster.dynamic_config = config.dynamic_config.clone();
    cluster.labels = config.cluster_labels.clone();
    cluster.cluster_type = stat.cluster_type;
    cluster.main_image = stat.main_image.clone();
    cluster.central_api_endpoint = stat.central_api_endpoint.clone();
    cluster.collection_method = stat.collection_method;
    cluster.collector_image = stat.collector_image.clone();
    cluster.admission_controller = stat.admission_controller;
    cluster.admission_controller_updates = stat.admission_controller_updates;
    cluster.admission_controller_events = stat.admission_controller_events;
    cluster.tolerations_config = stat.tolerations_config.clone();
    cluster.slim_collector = stat.slim_collector;
}
