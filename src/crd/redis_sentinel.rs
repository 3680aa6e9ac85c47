//! RedisSentinel Custom Resource Definition.
//!
//! A set of Sentinel processes monitoring a RedisReplication, which is
//! referenced by name in the same namespace.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, PodSecurityContext, SecurityContext, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{
    Condition, InitContainer, KubernetesConfig, Probe, RedisConfig, Sidecar, TlsConfig,
};

/// RedisSentinel deploys Sentinel processes for a RedisReplication.
///
/// Example:
/// ```yaml
/// apiVersion: redis.redis.opstreelabs.in/v1beta1
/// kind: RedisSentinel
/// metadata:
///   name: redis-sentinel
/// spec:
///   size: 3
///   kubernetesConfig:
///     image: quay.io/opstree/redis-sentinel:v7.0.12
///   redisSentinelConfig:
///     redisReplicationName: redis-replication
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "redis.redis.opstreelabs.in",
    version = "v1beta1",
    kind = "RedisSentinel",
    plural = "redissentinels",
    shortname = "rs",
    status = "RedisSentinelStatus",
    namespaced,
    printcolumn = r#"{"name":"Size", "type":"integer", "jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Master", "type":"string", "jsonPath":".status.masterAddress"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RedisSentinelSpec {
    /// Number of Sentinel processes.
    #[serde(default = "default_size")]
    pub size: i32,

    pub kubernetes_config: KubernetesConfig,

    #[serde(default)]
    pub redis_sentinel_config: RedisSentinelConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_config: Option<RedisConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_security_context: Option<PodSecurityContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    #[serde(rename = "TLS", default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<RedisPodDisruptionBudget>,

    #[serde(default)]
    pub readiness_probe: Probe,

    #[serde(default)]
    pub liveness_probe: Probe,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_container: Option<InitContainer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecars: Option<Vec<Sidecar>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
}

fn default_size() -> i32 {
    3
}

/// Sentinel monitoring settings.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisSentinelConfig {
    /// Name of a ConfigMap with extra sentinel directives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_sentinel_config: Option<String>,

    /// Name of the RedisReplication to monitor, in the same namespace.
    #[serde(default = "default_redis_replication_name")]
    pub redis_replication_name: String,

    #[serde(default = "default_master_group_name")]
    pub master_group_name: String,

    #[serde(default = "default_redis_port")]
    pub redis_port: String,

    #[serde(default = "default_quorum")]
    pub quorum: String,

    #[serde(default = "default_parallel_syncs")]
    pub parallel_syncs: String,

    #[serde(default = "default_failover_timeout")]
    pub failover_timeout: String,

    #[serde(default = "default_down_after_milliseconds")]
    pub down_after_milliseconds: String,
}

impl Default for RedisSentinelConfig {
    fn default() -> Self {
        Self {
            additional_sentinel_config: None,
            redis_replication_name: default_redis_replication_name(),
            master_group_name: default_master_group_name(),
            redis_port: default_redis_port(),
            quorum: default_quorum(),
            parallel_syncs: default_parallel_syncs(),
            failover_timeout: default_failover_timeout(),
            down_after_milliseconds: default_down_after_milliseconds(),
        }
    }
}

fn default_redis_replication_name() -> String {
    "redis-sentinel".to_string()
}

fn default_master_group_name() -> String {
    "redisSentinelCluster".to_string()
}

fn default_redis_port() -> String {
    "26379".to_string()
}

fn default_quorum() -> String {
    "2".to_string()
}

fn default_parallel_syncs() -> String {
    "1".to_string()
}

fn default_failover_timeout() -> String {
    "180000".to_string()
}

fn default_down_after_milliseconds() -> String {
    "30000".to_string()
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisPodDisruptionBudget {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,
}

/// Observed state of a RedisSentinel.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisSentinelStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub ready_replicas: i32,

    /// Address of the monitored master, as handed to the sentinels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_address: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}
