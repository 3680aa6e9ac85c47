//! Desired objects for a RedisSentinel.
//!
//! The sentinel workload has no persistent storage; its only derived input is
//! the address of the master it should monitor.

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;

use crate::crd::RedisSentinel;
use crate::resources::common::{
    SetupMode, owner_reference, sentinel_workload_name, workload_annotations, workload_labels,
};
use crate::resources::env::sentinel_env_vars;
use crate::resources::statefulset::{WorkloadParams, generate_statefulset};

/// Lower a RedisSentinel into workload parameters.
///
/// `master_address` is the resolved master of the referenced replication,
/// or `None` while no master is known.
pub fn sentinel_params(resource: &RedisSentinel, master_address: Option<&str>) -> WorkloadParams {
    let resource_name = resource.name_any();
    let name = sentinel_workload_name(&resource_name);
    let spec = &resource.spec;
    let config = &spec.kubernetes_config;
    let mode = SetupMode::Sentinel;

    WorkloadParams {
        labels: workload_labels(&name, mode, resource.labels()),
        annotations: workload_annotations(&resource_name, resource.annotations()),
        namespace: resource.namespace(),
        owner: Some(owner_reference(resource)),
        mode,
        replicas: spec.size,

        image: config.image.clone(),
        image_pull_policy: config.image_pull_policy.clone(),
        resources: config.resources.clone(),
        password_secret: config.redis_secret.clone(),
        image_pull_secrets: config.image_pull_secrets.clone(),
        update_strategy: config.update_strategy.clone(),

        external_config: spec
            .redis_sentinel_config
            .additional_sentinel_config
            .clone(),
        tls: spec.tls.clone(),

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
        extra_env: sentinel_env_vars(&spec.redis_sentinel_config, master_address),
        name,
        ..Default::default()
    }
}

/// Compile the desired StatefulSet of a RedisSentinel.
pub fn compile_sentinel(resource: &RedisSentinel, master_address: Option<&str>) -> StatefulSet {
    generate_statefulset(&sentinel_params(resource, master_address))
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
    use crate::crd::RedisSentinelSpec;
    use k8s_openapi::api::core::v1::EnvVar;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn resource() -> RedisSentinel {
        let mut spec = RedisSentinelSpec {
            size: 3,
            ..Default::default()
        };
        spec.kubernetes_config.image = "quay.io/opstree/redis-sentinel:v7.0.12".to_string();
        spec.redis_sentinel_config.redis_replication_name = "cache".to_string();
        RedisSentinel {
            metadata: ObjectMeta {
                name: Some("rs".to_string()),
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    fn main_env(sts: &StatefulSet) -> Vec<EnvVar> {
        sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .env
            .clone()
            .unwrap()
    }

    fn value<'a>(env: &'a [EnvVar], name: &str) -> Option<&'a str> {
        env.iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    #[test]
    fn test_sentinel_workload_shape() {
        let sts = compile_sentinel(&resource(), Some("10.0.0.5"));
        assert_eq!(sts.metadata.name.as_deref(), Some("rs-sentinel"));
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name.as_deref(), Some("rs-sentinel-headless"));
        assert!(spec.volume_claim_templates.is_none());

        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 26379);
    }

    #[test]
    fn test_master_address_feeds_env() {
        let env = main_env(&compile_sentinel(&resource(), Some("[fd00::5]")));
        assert_eq!(value(&env, "IP"), Some("[fd00::5]"));
        assert_eq!(value(&env, "MASTER_GROUP_NAME"), Some("redisSentinelCluster"));
        assert_eq!(value(&env, "PORT"), Some("26379"));
        assert_eq!(value(&env, "QUORUM"), Some("2"));
        assert_eq!(value(&env, "SETUP_MODE"), Some("sentinel"));
        assert_eq!(value(&env, "REDIS_ADDR"), Some("redis://localhost:26379"));

        let names: Vec<_> = env.iter().map(|e| e.name.clone()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_unknown_master_leaves_ip_empty() {
        let env = main_env(&compile_sentinel(&resource(), None));
        let ip = env.iter().find(|e| e.name == "IP").unwrap();
        assert!(ip.value.is_none());
    }

    #[test]
    fn test_additional_config_mounted() {
        let mut rs = resource();
        rs.spec.redis_sentinel_config.additional_sentinel_config = Some("rs-extra".to_string());
        let sts = compile_sentinel(&rs, None);
        let pod = sts.spec.unwrap().template.spec.unwrap();
        let volume = &pod.volumes.unwrap()[0];
        assert_eq!(volume.name, "external-config");
        assert_eq!(volume.config_map.as_ref().unwrap().name, "rs-extra");
    }
}
