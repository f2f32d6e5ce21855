//! Environment configuration for the cluster registry
//!
//! Provides trait-based access to environment configuration,
//! enabling dependency injection and mocking for tests.

use std::time::Duration;

use crate::{Error, Result};

/// Grace window after last contact during which a replacement agent must
/// prove continuity with the previous one
pub const DEFAULT_CLUSTER_MOVE_GRACE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// How long teardown waits for a terminated agent connection to stop
pub const DEFAULT_CONNECTION_TERMINATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Admission controller timeout applied when none (or zero) is configured
pub const DEFAULT_ADMISSION_CONTROLLER_TIMEOUT_SECS: i32 = 3;

/// Capacity of the decommission job queue
pub const DEFAULT_CASCADE_QUEUE_CAPACITY: usize = 256;

/// Environment variable overriding the grace period (seconds)
pub const ENV_CLUSTER_MOVE_GRACE_SECS: &str = "OUTPOST_CLUSTER_MOVE_GRACE_SECS";

/// Environment variable overriding the termination timeout (seconds)
pub const ENV_CONNECTION_TERMINATION_TIMEOUT_SECS: &str =
    "OUTPOST_CONNECTION_TERMINATION_TIMEOUT_SECS";

/// Environment variable overriding the cascade queue capacity
pub const ENV_CASCADE_QUEUE_CAPACITY: &str = "OUTPOST_CASCADE_QUEUE_CAPACITY";

/// Trait for reading registry configuration from the environment
///
/// This abstracts reading from environment variables, enabling
/// proper unit testing without manipulating global state.
#[cfg_attr(test, mockall::automock)]
pub trait EnvConfig: Send + Sync {
    /// Get a raw variable value, if set
    fn var(&self, key: &str) -> Option<String>;
}

/// Default implementation that reads from process environment variables
#[derive(Clone, Default)]
pub struct OsEnvConfig;

impl EnvConfig for OsEnvConfig {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Tunables for the cluster registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Anti-hijack grace window measured from the last agent contact
    pub cluster_move_grace_period: Duration,
    /// Upper bound on waiting for a terminated connection during teardown
    pub connection_termination_timeout: Duration,
    /// Admission controller timeout used when unset or zero
    pub default_admission_timeout_secs: i32,
    /// Number of decommission jobs that can wait in the queue
    pub cascade_queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cluster_move_grace_period: DEFAULT_CLUSTER_MOVE_GRACE_PERIOD,
            connection_termination_timeout: DEFAULT_CONNECTION_TERMINATION_TIMEOUT,
            default_admission_timeout_secs: DEFAULT_ADMISSION_CONTROLLER_TIMEOUT_SECS,
            cascade_queue_capacity: DEFAULT_CASCADE_QUEUE_CAPACITY,
        }
    }
}

impl RegistryConfig {
    /// Build a config from the environment, falling back to defaults for
    /// unset variables
    ///
    /// Returns a validation error for values that do not parse.
    pub fn from_env(env: &dyn EnvConfig) -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64>(env, ENV_CLUSTER_MOVE_GRACE_SECS)? {
            config.cluster_move_grace_period = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(env, ENV_CONNECTION_TERMINATION_TIMEOUT_SECS)? {
            config.connection_termination_timeout = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse_var::<usize>(env, ENV_CASCADE_QUEUE_CAPACITY)? {
            if capacity == 0 {
                return Err(Error::validation_for_field(
                    "config",
                    ENV_CASCADE_QUEUE_CAPACITY,
                    "queue capacity must be at least 1",
                ));
            }
            config.cascade_queue_capacity = capacity;
        }

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(env: &dyn EnvConfig, key: &str) -> Result<Option<T>> {
    match env.var(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            Error::validation_for_field("config", key, format!("cannot parse {:?}", raw))
        }),
    }
}
