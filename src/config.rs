//! Operator configuration read from the environment.

use std::time::Duration;

use thiserror::Error;

/// Invalid operator configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Namespace to watch; all namespaces when unset.
    pub watch_namespace: Option<String>,
    /// Bound on each replica probe (connect and query).
    pub probe_timeout: Duration,
    /// Periodic requeue after a successful reconcile.
    pub requeue_interval: Duration,
    pub health_port: u16,
    /// Identity used for leader election and event reporting.
    pub pod_name: Option<String>,
    pub pod_namespace: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            probe_timeout: Duration::from_secs(5),
            requeue_interval: Duration::from_secs(60),
            health_port: 8080,
            pod_name: None,
            pod_namespace: "default".to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            watch_namespace: non_empty("WATCH_NAMESPACE"),
            probe_timeout: match non_empty("PROBE_TIMEOUT_SECS") {
                Some(v) => Duration::from_secs(parse_positive("PROBE_TIMEOUT_SECS", &v)?),
                None => defaults.probe_timeout,
            },
            requeue_interval: match non_empty("REQUEUE_SECS") {
                Some(v) => Duration::from_secs(parse_positive("REQUEUE_SECS", &v)?),
                None => defaults.requeue_interval,
            },
            health_port: match non_empty("HEALTH_PORT") {
                Some(v) => u16::try_from(parse_positive("HEALTH_PORT", &v)?).map_err(|_| {
                    ConfigError::InvalidNumber {
                        name: "HEALTH_PORT",
                        value: v.clone(),
                    }
                })?,
                None => defaults.health_port,
            },
            pod_name: non_empty("POD_NAME"),
            pod_namespace: non_empty("POD_NAMESPACE").unwrap_or(defaults.pod_namespace),
        })
    }
}

fn parse_positive(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| ConfigError::InvalidNumber {
            name,
            value: value.to_string(),
        })
}
