//! Metrics registry for cluster lifecycle observability
//!
//! Provides OpenTelemetry metrics for:
//! - Registered clusters
//! - Reconciliation outcomes for agent announcements
//! - Decommission cascades (duration, per-item failures)

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for Outpost metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("outpost"));

// ============================================================================
// Cluster Registry Metrics
// ============================================================================

/// Gauge tracking the number of registered clusters
pub static CLUSTERS_REGISTERED: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("outpost_clusters_registered")
        .with_description("Number of clusters currently registered")
        .with_unit("{clusters}")
        .build()
});

/// Counter of reconciliation outcomes
///
/// Labels:
/// - `outcome`: created, adopted, updated, unchanged, cleared, rejected
pub static RECONCILE_OUTCOMES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("outpost_reconcile_outcomes_total")
        .with_description("Total number of agent announcement reconciliations by outcome")
        .with_unit("{reconciliations}")
        .build()
});

// ============================================================================
// Decommission Metrics
// ============================================================================

/// Histogram of decommission cascade duration
pub static CASCADE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("outpost_cascade_duration_seconds")
        .with_description("Duration of decommission cascades in seconds")
        .with_unit("s")
        .build()
});

/// Counter of per-item cascade failures
///
/// Labels:
/// - `subsystem`: health, namespaces, deployments, alerts, pods, nodes,
///   network_entities, network_baselines, secrets
pub static CASCADE_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("outpost_cascade_failures_total")
        .with_description("Total number of dependent-resource failures during decommission")
        .with_unit("{failures}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Labels for reconciliation outcome metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A new cluster record was created
    Created,
    /// An existing cluster was adopted without declarative changes
    Adopted,
    /// Declarative configuration was re-applied
    Updated,
    /// Fingerprint matched, nothing written
    Unchanged,
    /// Declarative configuration was cleared
    Cleared,
    /// The announcement was rejected
    Rejected,
}

impl ReconcileOutcome {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Adopted => "adopted",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Cleared => "cleared",
            Self::Rejected => "rejected",
        }
    }
}

// ============================================================================
// Recording Helpers
// ============================================================================

/// Record a reconciliation outcome
pub fn record_reconcile(outcome: ReconcileOutcome) {
    RECONCILE_OUTCOMES.add(1, &[KeyValue::new("outcome", outcome.as_str())]);
}

/// Record the number of registered clusters
pub fn set_clusters_registered(count: usize) {
    CLUSTERS_REGISTERED.record(count as i64, &[]);
}

/// Record a finished cascade with its per-subsystem failure counts
pub fn record_cascade(duration_secs: f64, failures: &[(&'static str, u64)]) {
    CASCADE_DURATION.record(duration_secs, &[]);
    for (subsystem, count) in failures {
        if *count > 0 {
            CASCADE_FAILURES.add(*count, &[KeyValue::new("subsystem", *subsystem)]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_outcome_labels() {
        assert_eq!(ReconcileOutcome::Created.as_str(), "created");
        assert_eq!(ReconcileOutcome::Adopted.as_str(), "adopted");
        assert_eq!(ReconcileOutcome::Updated.as_str(), "updated");
        assert_eq!(ReconcileOutcome::Unchanged.as_str(), "unchanged");
        assert_eq!(ReconcileOutcome::Cleared.as_str(), "cleared");
        assert_eq!(ReconcileOutcome::Rejected.as_str(), "rejected");
    }

    #[test]
    fn test_recording_without_provider_is_noop() {
        // The global meter falls back to a no-op provider when none is installed
        record_reconcile(ReconcileOutcome::Created);
        set_clusters_registered(3);
        record_cascade(0.25, &[("pods", 2), ("secrets", 0)]);
    }
}
