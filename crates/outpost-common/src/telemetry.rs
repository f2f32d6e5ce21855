//! Logging and OpenTelemetry export for Outpost processes
//!
//! Logs are JSON lines. Outpost's own crates log at a configurable level and
//! everything else at `info`. When an OTLP endpoint is configured, spans and
//! the registry metrics are exported to it, tagged with the registry tunables
//! the process runs with so dashboards can tell deployments apart.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{EnvConfig, RegistryConfig};
use crate::{Error, Result};

/// Environment variable naming the OTLP collector
pub const ENV_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Environment variable identifying this replica in exported telemetry
pub const ENV_INSTANCE_ID: &str = "OUTPOST_INSTANCE_ID";

/// Environment variable setting the log level of the Outpost crates
pub const ENV_LOG_LEVEL: &str = "OUTPOST_LOG_LEVEL";

/// Crates logged at the configured level
const OUTPOST_TARGETS: [&str; 3] = ["outpost", "outpost_cluster", "outpost_common"];

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

const DEFAULT_LOG_LEVEL: &str = "debug";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to build {signal} exporter: {message}")]
    Exporter {
        /// Signal the exporter was for ("traces" or "metrics")
        signal: &'static str,
        /// Exporter error
        message: String,
    },

    /// A global subscriber is already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// How a process logs and exports telemetry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name for traces and metrics
    pub service_name: String,
    /// OTLP collector; logs only when unset
    pub otlp_endpoint: Option<String>,
    /// Replica id reported as `service.instance.id`
    pub instance_id: Option<String>,
    /// Level for the Outpost crates when `RUST_LOG` is unset
    pub log_level: String,
    /// Registry tunables reported as resource attributes
    pub registry: Option<RegistryConfig>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "outpost".to_string(),
            otlp_endpoint: None,
            instance_id: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            registry: None,
        }
    }
}

impl TelemetryConfig {
    /// Read the endpoint, instance id and log level from the environment
    ///
    /// Blank values count as unset. An unknown log level is a validation
    /// error, like any unparseable registry setting.
    pub fn from_env(service_name: impl Into<String>, env: &dyn EnvConfig) -> Result<Self> {
        let log_level = match env.var(ENV_LOG_LEVEL) {
            None => DEFAULT_LOG_LEVEL.to_string(),
            Some(raw) => {
                let level = raw.trim().to_ascii_lowercase();
                if !LOG_LEVELS.contains(&level.as_str()) {
                    return Err(Error::validation_for_field(
                        "config",
                        ENV_LOG_LEVEL,
                        format!("unknown log level {raw:?}"),
                    ));
                }
                level
            }
        };

        Ok(Self {
            service_name: service_name.into(),
            otlp_endpoint: non_blank(env.var(ENV_OTLP_ENDPOINT)),
            instance_id: non_blank(env.var(ENV_INSTANCE_ID)),
            log_level,
            registry: None,
        })
    }

    /// Report `registry`'s tunables with every exported span and metric
    pub fn with_registry(mut self, registry: &RegistryConfig) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    fn default_directives(&self) -> String {
        let mut directives = vec!["info".to_string()];
        directives.extend(
            OUTPOST_TARGETS
                .iter()
                .map(|target| format!("{target}={}", self.log_level)),
        );
        directives.join(",")
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new(SERVICE_NAME, self.service_name.clone()),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ];
        if let Some(instance) = &self.instance_id {
            attributes.push(KeyValue::new("service.instance.id", instance.clone()));
        }
        if let Some(registry) = &self.registry {
            attributes.extend([
                KeyValue::new(
                    "outpost.registry.cluster_move_grace_secs",
                    secs(registry.cluster_move_grace_period),
                ),
                KeyValue::new(
                    "outpost.registry.connection_termination_timeout_secs",
                    secs(registry.connection_termination_timeout),
                ),
                KeyValue::new(
                    "outpost.registry.cascade_queue_capacity",
                    i64::try_from(registry.cascade_queue_capacity).unwrap_or(i64::MAX),
                ),
            ]);
        }
        Resource::new(attributes)
    }
}

/// Install the global subscriber, and the OTLP exporters when configured
///
/// `RUST_LOG` overrides the per-crate filter. Fails if a subscriber is
/// already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> std::result::Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = config.resource();
            global::set_meter_provider(meter_provider(endpoint, resource.clone())?);
            let provider = tracer_provider(endpoint, resource)?;
            let tracer = provider.tracer(config.service_name.clone());
            global::set_tracer_provider(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directives()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

fn tracer_provider(
    endpoint: &str,
    resource: Resource,
) -> std::result::Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "traces",
            message: e.to_string(),
        })?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn meter_provider(
    endpoint: &str,
    resource: Resource,
) -> std::result::Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "metrics",
            message: e.to_string(),
        })?;

    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secs(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}
