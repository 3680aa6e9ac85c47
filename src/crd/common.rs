//! Spec types shared by the RedisReplication and RedisSentinel resources.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSetUpdateStrategy;
use k8s_openapi::api::core::v1::{
    ContainerPort, EnvVar, LocalObjectReference, PersistentVolumeClaim, ResourceRequirements,
    SecretVolumeSource, Volume, VolumeMount,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Container, image and service settings for the managed workload.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    /// Container image for the Redis (or Sentinel) process.
    pub image: String,

    /// Image pull policy (Always, IfNotPresent, Never).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Secret holding the Redis password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_secret: Option<ExistingPasswordSecret>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<StatefulSetUpdateStrategy>,

    /// Settings for the additional client service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceConfig>,
}

/// Reference to a key inside an existing Secret.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExistingPasswordSecret {
    pub name: String,
    pub key: String,
}

/// Additional service configuration.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Service type of the `-additional` service.
    #[serde(default = "default_service_type")]
    pub service_type: String,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            annotations: BTreeMap::new(),
        }
    }
}

fn default_service_type() -> String {
    "ClusterIP".to_string()
}

/// Redis server configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    /// Name of a ConfigMap mounted under `/etc/redis/external.conf.d`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_redis_config: Option<String>,
}

/// Persistent storage for replicas.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    /// Template for the per-replica data claim.
    #[serde(default)]
    pub volume_claim_template: PersistentVolumeClaim,

    /// Extra volumes and mounts added to the Redis container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mount: Option<AdditionalVolume>,

    /// Adds a `node-conf` claim mounted at `/node-conf`.
    #[serde(default)]
    pub node_conf_volume: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_conf_volume_claim_template: Option<PersistentVolumeClaim>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalVolume {
    #[serde(default)]
    pub volume: Vec<Volume>,
    #[serde(default)]
    pub mount_path: Vec<VolumeMount>,
}

/// TLS material for Redis and its clients.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Key of the CA certificate in the secret (default `ca.crt`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_key_file: Option<String>,
    /// Key of the server certificate in the secret (default `tls.crt`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_key_file: Option<String>,
    /// Key of the private key in the secret (default `tls.key`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    /// Secret volume holding the certificates.
    pub secret: SecretVolumeSource,
}

pub const DEFAULT_TLS_CA_KEY: &str = "ca.crt";
pub const DEFAULT_TLS_CERT_KEY: &str = "tls.crt";
pub const DEFAULT_TLS_KEY: &str = "tls.key";

impl TlsConfig {
    pub fn ca_key(&self) -> &str {
        non_empty_or(self.ca_key_file.as_deref(), DEFAULT_TLS_CA_KEY)
    }

    pub fn cert_key(&self) -> &str {
        non_empty_or(self.cert_key_file.as_deref(), DEFAULT_TLS_CERT_KEY)
    }

    pub fn key(&self) -> &str {
        non_empty_or(self.key_file.as_deref(), DEFAULT_TLS_KEY)
    }

    /// Name of the secret holding the certificates.
    pub fn secret_name(&self) -> Option<&str> {
        self.secret.secret_name.as_deref().filter(|s| !s.is_empty())
    }
}

fn non_empty_or<'a>(value: Option<&'a str>, default: &'a str) -> &'a str {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => default,
    }
}

/// Access-control list configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AclConfig {
    /// Secret containing a `user.acl` key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretVolumeSource>,
}

/// Health probe thresholds. The probe action itself is fixed.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    #[serde(default = "default_initial_delay_seconds")]
    pub initial_delay_seconds: i32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: i32,
    #[serde(default = "default_period_seconds")]
    pub period_seconds: i32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: i32,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: i32,
}

impl Default for Probe {
    fn default() -> Self {
        Self {
            initial_delay_seconds: default_initial_delay_seconds(),
            timeout_seconds: default_timeout_seconds(),
            period_seconds: default_period_seconds(),
            success_threshold: default_success_threshold(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

fn default_initial_delay_seconds() -> i32 {
    1
}

fn default_timeout_seconds() -> i32 {
    1
}

fn default_period_seconds() -> i32 {
    10
}

fn default_success_threshold() -> i32 {
    1
}

fn default_failure_threshold() -> i32 {
    3
}

/// Init container run before the Redis container.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitContainer {
    #[serde(default)]
    pub enabled: bool,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

/// User-supplied sidecar container.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<ContainerPort>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts: Option<Vec<VolumeMount>>,
}

/// Prometheus exporter sidecar.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisExporter {
    #[serde(default)]
    pub enabled: bool,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
}

/// Standard Kubernetes condition.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Ready", ready, reason, message, generation)
    }

    /// Create a "MasterResolved" condition.
    pub fn master_resolved(
        resolved: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new("MasterResolved", resolved, reason, message, generation)
    }
}

/// Replace a condition of the same type, keeping the old transition time
/// when the status did not change.
pub fn upsert_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}
