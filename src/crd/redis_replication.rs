//! RedisReplication Custom Resource Definition.
//!
//! A fixed-size set of Redis replicas backed by per-replica storage. One
//! replica is master at any time; which one is discovered at runtime.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, PodSecurityContext, SecurityContext, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{
    AclConfig, Condition, InitContainer, KubernetesConfig, Probe, RedisConfig, RedisExporter,
    Sidecar, Storage, TlsConfig,
};

/// RedisReplication deploys a replicated Redis set.
///
/// Example:
/// ```yaml
/// apiVersion: redis.redis.opstreelabs.in/v1beta1
/// kind: RedisReplication
/// metadata:
///   name: redis-replication
/// spec:
///   clusterSize: 3
///   kubernetesConfig:
///     image: quay.io/opstree/redis:v7.0.12
///   storage:
///     volumeClaimTemplate:
///       spec:
///         accessModes: ["ReadWriteOnce"]
///         resources:
///           requests:
///             storage: 1Gi
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "redis.redis.opstreelabs.in",
    version = "v1beta1",
    kind = "RedisReplication",
    plural = "redisreplications",
    shortname = "rr",
    status = "RedisReplicationStatus",
    namespaced,
    printcolumn = r#"{"name":"Size", "type":"integer", "jsonPath":".spec.clusterSize"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Master", "type":"string", "jsonPath":".status.masterNode"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RedisReplicationSpec {
    /// Number of Redis replicas.
    #[serde(default = "default_cluster_size")]
    pub cluster_size: i32,

    pub kubernetes_config: KubernetesConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_config: Option<RedisConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Storage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_exporter: Option<RedisExporter>,

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
    pub acl: Option<AclConfig>,

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

fn default_cluster_size() -> i32 {
    3
}

/// Observed state of a RedisReplication.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisReplicationStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub ready_replicas: i32,

    /// Pod name of the replica currently reporting the master role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_node: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl RedisReplication {
    /// Whether the replicas persist data to claims.
    pub fn persistence_enabled(&self) -> bool {
        self.spec.storage.is_some()
    }
}
