//! Outpost - cluster lifecycle core of a fleet-management control plane

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use outpost::cluster::{ClusterRegistry, MemoryBackend};
use outpost::common::telemetry::{init_telemetry, TelemetryConfig};
use outpost::common::{OsEnvConfig, RegistryConfig};

/// Outpost - runs the cluster registry over in-memory collaborators
#[derive(Parser, Debug)]
#[command(name = "outpost", version, about, long_about = None)]
struct Cli {
    /// Service name reported in traces and metrics
    #[arg(long, default_value = "outpost-central")]
    service_name: String,

    /// OTLP collector endpoint; falls back to OTEL_EXPORTER_OTLP_ENDPOINT
    #[arg(long)]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = RegistryConfig::from_env(&OsEnvConfig)?;

    let mut telemetry =
        TelemetryConfig::from_env(cli.service_name, &OsEnvConfig)?.with_registry(&config);
    if cli.otlp_endpoint.is_some() {
        telemetry.otlp_endpoint = cli.otlp_endpoint;
    }
    init_telemetry(&telemetry)?;

    info!(
        grace_secs = config.cluster_move_grace_period.as_secs(),
        termination_timeout_secs = config.connection_termination_timeout.as_secs(),
        queue_capacity = config.cascade_queue_capacity,
        "Starting cluster registry"
    );

    let backend = MemoryBackend::new();
    let registry = Arc::new(ClusterRegistry::new(backend.collaborators(), config));
    registry.initialize().await?;

    tokio::signal::ctrl_c().await?;
    info!(
        pending_decommissions = registry.pending_decommissions(),
        "Shutting down"
    );
    Ok(())
}
