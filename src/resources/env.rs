//! Environment generation for Redis and Sentinel containers.
//!
//! The generated list is always sorted by name. Optional variables are
//! appended in whatever order the inputs produce them, and the stored
//! object is compared field by field, so an unsorted list would show up as
//! a change on every pass.

use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, SecretKeySelector};

use crate::crd::{ExistingPasswordSecret, RedisSentinelConfig, TlsConfig};
use crate::resources::common::SetupMode;

/// Mount point of the TLS secret.
pub const TLS_MOUNT_PATH: &str = "/tls";

/// Inputs for one container's environment.
#[derive(Debug, Clone, Copy)]
pub struct EnvInputs<'a> {
    pub mode: SetupMode,
    /// Add the exporter's TLS client settings.
    pub exporter: bool,
    pub password: Option<&'a ExistingPasswordSecret>,
    pub persistence: bool,
    pub tls: Option<&'a TlsConfig>,
    pub acl: bool,
    /// Extra variables, merged before sorting.
    pub extra: &'a [EnvVar],
}

fn value_var(name: &str, value: impl Into<String>) -> EnvVar {
    let value = value.into();
    EnvVar {
        name: name.to_string(),
        // The API server drops empty values; emitting them would never converge.
        value: if value.is_empty() { None } else { Some(value) },
        ..Default::default()
    }
}

fn tls_path(file: &str) -> String {
    format!("{}/{}", TLS_MOUNT_PATH, file)
}

/// TLS variables for the Redis process.
pub fn tls_env_vars(tls: &TlsConfig) -> Vec<EnvVar> {
    vec![
        value_var("TLS_MODE", "true"),
        value_var("REDIS_TLS_CA_KEY", tls_path(tls.ca_key())),
        value_var("REDIS_TLS_CERT", tls_path(tls.cert_key())),
        value_var("REDIS_TLS_CERT_KEY", tls_path(tls.key())),
    ]
}

fn exporter_tls_env_vars(tls: &TlsConfig) -> Vec<EnvVar> {
    vec![
        value_var("REDIS_EXPORTER_TLS_CLIENT_KEY_FILE", tls_path(tls.key())),
        value_var("REDIS_EXPORTER_TLS_CLIENT_CERT_FILE", tls_path(tls.cert_key())),
        value_var("REDIS_EXPORTER_TLS_CA_CERT_FILE", tls_path(tls.ca_key())),
        value_var("REDIS_EXPORTER_SKIP_TLS_VERIFICATION", "true"),
    ]
}

/// Generate a container's environment, sorted by name.
pub fn generate_env_vars(inputs: &EnvInputs<'_>) -> Vec<EnvVar> {
    let mode = inputs.mode.as_str();
    let mut env = vec![
        value_var("SERVER_MODE", mode),
        value_var("SETUP_MODE", mode),
        value_var(
            "REDIS_ADDR",
            format!("redis://localhost:{}", inputs.mode.port()),
        ),
    ];

    if let Some(tls) = inputs.tls {
        env.extend(tls_env_vars(tls));
        if inputs.exporter {
            env.extend(exporter_tls_env_vars(tls));
        }
    }

    if inputs.acl {
        env.push(value_var("ACL_MODE", "true"));
    }

    if let Some(secret) = inputs.password {
        env.push(EnvVar {
            name: "REDIS_PASSWORD".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.name.clone(),
                    key: secret.key.clone(),
                    optional: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    if inputs.persistence {
        env.push(value_var("PERSISTENCE_ENABLED", "true"));
    }

    env.extend(inputs.extra.iter().cloned());
    sort_env_vars(env)
}

/// Stable sort by name; duplicates keep their relative order.
pub fn sort_env_vars(mut env: Vec<EnvVar>) -> Vec<EnvVar> {
    env.sort_by(|a, b| a.name.cmp(&b.name));
    env
}

/// Sentinel monitoring variables. An unknown master yields an `IP` variable
/// without a value.
pub fn sentinel_env_vars(config: &RedisSentinelConfig, master_address: Option<&str>) -> Vec<EnvVar> {
    vec![
        value_var("MASTER_GROUP_NAME", config.master_group_name.as_str()),
        value_var("IP", master_address.unwrap_or_default()),
        value_var("PORT", config.redis_port.as_str()),
        value_var("QUORUM", config.quorum.as_str()),
        value_var(
            "DOWN_AFTER_MILLISECONDS",
            config.down_after_milliseconds.as_str(),
        ),
        value_var("PARALLEL_SYNCS", config.parallel_syncs.as_str()),
        value_var("FAILOVER_TIMEOUT", config.failover_timeout.as_str()),
    ]
}
