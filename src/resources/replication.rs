//! Desired objects for a RedisReplication.

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;

use crate::crd::RedisReplication;
use crate::resources::common::{SetupMode, owner_reference, workload_annotations, workload_labels};
use crate::resources::statefulset::{WorkloadParams, generate_statefulset};

/// Lower a RedisReplication into workload parameters.
///
/// The workload is named after the resource and always requests exactly
/// `clusterSize` replicas.
pub fn replication_params(resource: &RedisReplication) -> WorkloadParams {
    let name = resource.name_any();
    let spec = &resource.spec;
    let config = &spec.kubernetes_config;
    let mode = SetupMode::Replication;

    WorkloadParams {
        labels: workload_labels(&name, mode, resource.labels()),
        annotations: workload_annotations(&name, resource.annotations()),
        namespace: resource.namespace(),
        owner: Some(owner_reference(resource)),
        mode,
        replicas: spec.cluster_size,

        image: config.image.clone(),
        image_pull_policy: config.image_pull_policy.clone(),
        resources: config.resources.clone(),
        password_secret: config.redis_secret.clone(),
        image_pull_secrets: config.image_pull_secrets.clone(),
        update_strategy: config.update_strategy.clone(),

        external_config: spec
            .redis_config
            .as_ref()
            .and_then(|c| c.additional_redis_config.clone()),
        storage: spec.storage.clone(),
        exporter: spec.redis_exporter.clone(),
        tls: spec.tls.clone(),
        acl: spec.acl.clone(),

        node_selector: spec.node_selector.clone(),
        pod_security_context: spec.pod_security_context.clone(),
        security_context: spec.security_context.clone(),
        priority_class_name: spec.priority_class_name.clone(),
        affinity: spec.affinity.clone(),
        tolerations: spec.tolerations.clone(),
        service_account_name: spec.service_account_name.clone(),
        termination_grace_period_seconds: spec.termination_grace_period_seconds,

        readiness_probe: spec.readiness_probe.clone(),
        liveness_probe: spec.liveness_probe.clone(),
        init_container: spec.init_container.clone(),
        sidecars: spec.sidecars.clone().unwrap_or_default(),
        extra_env: Vec::new(),
        name,
    }
}

/// Compile the desired StatefulSet of a RedisReplication.
pub fn compile_replication(resource: &RedisReplication) -> StatefulSet {
    generate_statefulset(&replication_params(resource))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use crate::crd::{ExistingPasswordSecret, RedisReplicationSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn resource(size: i32) -> RedisReplication {
        let mut spec = RedisReplicationSpec {
            cluster_size: size,
            ..Default::default()
        };
        spec.kubernetes_config.image = "quay.io/opstree/redis:v7.0.12".to_string();
        RedisReplication {
            metadata: ObjectMeta {
                name: Some("cache".to_string()),
                namespace: Some("prod".to_string()),
                uid: Some("uid-1".to_string()),
                labels: Some(BTreeMap::from([("team".to_string(), "a".to_string())])),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    #[test]
    fn test_replicas_follow_cluster_size() {
        for size in [1, 3, 7] {
            let sts = compile_replication(&resource(size));
            assert_eq!(sts.spec.unwrap().replicas, Some(size));
        }
    }

    #[test]
    fn test_identity_and_ownership() {
        let sts = compile_replication(&resource(3));
        assert_eq!(sts.metadata.name.as_deref(), Some("cache"));
        assert_eq!(sts.metadata.namespace.as_deref(), Some("prod"));
        let labels = sts.metadata.labels.unwrap();
        assert_eq!(labels.get("team").unwrap(), "a");
        assert_eq!(labels.get("redis_setup_type").unwrap(), "replication");
        let owners = sts.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "RedisReplication");
        assert_eq!(
            sts.metadata
                .annotations
                .unwrap()
                .get("redis.opstreelabs.instance")
                .unwrap(),
            "cache"
        );
    }

    #[test]
    fn test_password_secret_reaches_main_container() {
        let mut rr = resource(3);
        rr.spec.kubernetes_config.redis_secret = Some(ExistingPasswordSecret {
            name: "redis-auth".to_string(),
            key: "password".to_string(),
        });
        let sts = compile_replication(&rr);
        let pod = sts.spec.unwrap().template.spec.unwrap();
        let env = pod.containers[0].env.clone().unwrap();
        let password = env.iter().find(|e| e.name == "REDIS_PASSWORD").unwrap();
        let selector = password
            .value_from
            .as_ref()
            .unwrap()
            .secret_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(selector.name, "redis-auth");
        assert_eq!(selector.key, "password");
    }
}
