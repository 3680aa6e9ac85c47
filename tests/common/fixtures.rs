//! Test fixtures and builder patterns for RedisReplication and RedisSentinel.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequirements,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use redis_sentinel_operator::crd::{
    ExistingPasswordSecret, KubernetesConfig, RedisExporter, RedisReplication,
    RedisReplicationSpec, RedisSentinel, RedisSentinelConfig, RedisSentinelSpec, Storage,
};

/// Builder for RedisReplication test fixtures.
///
/// # Example
/// ```ignore
/// let replication = ReplicationBuilder::new("cache")
///     .namespace("redis")
///     .cluster_size(3)
///     .storage("1Gi")
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct ReplicationBuilder {
    name: String,
    namespace: String,
    cluster_size: i32,
    image: String,
    storage: Option<String>,
    resources: Option<(String, String)>,
    exporter: bool,
    password: Option<(String, String)>,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    uid: String,
}

impl ReplicationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "default".to_string(),
            cluster_size: 3,
            image: "quay.io/opstree/redis:v7.0.12".to_string(),
            storage: None,
            resources: None,
            exporter: false,
            password: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            uid: "1b7c5e0a-0000-4000-8000-000000000001".to_string(),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn cluster_size(mut self, size: i32) -> Self {
        self.cluster_size = size;
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Request a data volume of `size` (a Kubernetes quantity).
    pub fn storage(mut self, size: impl Into<String>) -> Self {
        self.storage = Some(size.into());
        self
    }

    /// Request and limit `cpu` and `memory` for the Redis container.
    pub fn resources(mut self, cpu: impl Into<String>, memory: impl Into<String>) -> Self {
        self.resources = Some((cpu.into(), memory.into()));
        self
    }

    pub fn exporter(mut self, enabled: bool) -> Self {
        self.exporter = enabled;
        self
    }

    pub fn password_secret(mut self, name: impl Into<String>, key: impl Into<String>) -> Self {
        self.password = Some((name.into(), key.into()));
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Opt into delete-and-recreate on rejected updates.
    pub fn recreate_on_invalid(self) -> Self {
        self.annotation("redis.opstreelabs.in/recreate-statefulset", "true")
    }

    pub fn build(self) -> RedisReplication {
        RedisReplication {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                uid: Some(self.uid),
                generation: Some(1),
                labels: (!self.labels.is_empty()).then_some(self.labels),
                annotations: (!self.annotations.is_empty()).then_some(self.annotations),
                ..Default::default()
            },
            spec: RedisReplicationSpec {
                cluster_size: self.cluster_size,
                kubernetes_config: KubernetesConfig {
                    image: self.image,
                    redis_secret: self
                        .password
                        .map(|(name, key)| ExistingPasswordSecret { name, key }),
                    resources: self.resources.map(|(cpu, memory)| {
                        let quantities = BTreeMap::from([
                            ("cpu".to_string(), Quantity(cpu)),
                            ("memory".to_string(), Quantity(memory)),
                        ]);
                        ResourceRequirements {
                            requests: Some(quantities.clone()),
                            limits: Some(quantities),
                            ..Default::default()
                        }
                    }),
                    ..Default::default()
                },
                storage: self.storage.map(|size| Storage {
                    volume_claim_template: claim_template(&size),
                    ..Default::default()
                }),
                redis_exporter: self.exporter.then(|| RedisExporter {
                    enabled: true,
                    image: "quay.io/opstree/redis-exporter:v1.44.0".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            status: None,
        }
    }
}

/// Builder for RedisSentinel test fixtures.
#[derive(Clone, Debug)]
pub struct SentinelBuilder {
    name: String,
    namespace: String,
    size: i32,
    replication: String,
}

impl SentinelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "default".to_string(),
            size: 3,
            replication: "cache".to_string(),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn size(mut self, size: i32) -> Self {
        self.size = size;
        self
    }

    /// Name of the monitored RedisReplication.
    pub fn monitors(mut self, replication: impl Into<String>) -> Self {
        self.replication = replication.into();
        self
    }

    pub fn build(self) -> RedisSentinel {
        RedisSentinel {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                uid: Some("1b7c5e0a-0000-4000-8000-000000000002".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: RedisSentinelSpec {
                size: self.size,
                kubernetes_config: KubernetesConfig {
                    image: "quay.io/opstree/redis-sentinel:v7.0.12".to_string(),
                    ..Default::default()
                },
                redis_sentinel_config: RedisSentinelConfig {
                    redis_replication_name: self.replication,
                    ..Default::default()
                },
                ..Default::default()
            },
            status: None,
        }
    }
}

/// Volume claim template requesting `size` of storage.
pub fn claim_template(size: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta::default(),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// A bound claim as the StatefulSet controller would create it.
pub fn bound_claim(name: &str, labels: BTreeMap<String, String>, size: &str) -> PersistentVolumeClaim {
    let mut claim = claim_template(size);
    claim.metadata = ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(labels),
        ..Default::default()
    };
    claim
}
