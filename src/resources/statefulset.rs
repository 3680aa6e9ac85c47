//! StatefulSet generation for Redis and Sentinel workloads.
//!
//! Both resource kinds are lowered to [`WorkloadParams`] first, so there is
//! a single code path from parameters to the desired StatefulSet. Generation
//! is pure and deterministic: identical parameters give identical objects.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvVar, ExecAction, LocalObjectReference,
    PodSecurityContext, PodSpec, PodTemplateSpec, Probe as K8sProbe, ResourceRequirements,
    SecurityContext, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};

use crate::crd::{
    AclConfig, ExistingPasswordSecret, InitContainer, Probe, RedisExporter, Sidecar, Storage,
    TlsConfig,
};
use crate::resources::common::{
    EXPORTER_PORT, SetupMode, headless_service_name, selector_labels,
};
use crate::resources::env::{EnvInputs, generate_env_vars};
use crate::resources::volumes::{VolumeInputs, claim_templates, pod_volumes, volume_mounts};

const EXPORTER_CONTAINER: &str = "redis-exporter";
const HEALTHCHECK_COMMAND: [&str; 2] = ["bash", "/usr/bin/healthcheck.sh"];

/// Everything needed to generate one workload.
#[derive(Clone, Debug, Default)]
pub struct WorkloadParams {
    pub name: String,
    pub namespace: Option<String>,
    pub mode: SetupMode,
    pub replicas: i32,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,

    pub image: String,
    pub image_pull_policy: Option<String>,
    pub resources: Option<ResourceRequirements>,
    pub password_secret: Option<ExistingPasswordSecret>,
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,
    pub update_strategy: Option<StatefulSetUpdateStrategy>,

    pub external_config: Option<String>,
    pub storage: Option<Storage>,
    pub exporter: Option<RedisExporter>,
    pub tls: Option<TlsConfig>,
    pub acl: Option<AclConfig>,

    pub node_selector: Option<BTreeMap<String, String>>,
    pub pod_security_context: Option<PodSecurityContext>,
    pub security_context: Option<SecurityContext>,
    pub priority_class_name: Option<String>,
    pub affinity: Option<Affinity>,
    pub tolerations: Option<Vec<Toleration>>,
    pub service_account_name: Option<String>,
    pub termination_grace_period_seconds: Option<i64>,

    pub readiness_probe: Probe,
    pub liveness_probe: Probe,
    pub init_container: Option<InitContainer>,
    pub sidecars: Vec<Sidecar>,

    /// Mode-specific variables for the main container.
    pub extra_env: Vec<EnvVar>,
}

impl WorkloadParams {
    fn volume_inputs(&self) -> VolumeInputs<'_> {
        VolumeInputs {
            workload: &self.name,
            storage: self.storage.as_ref(),
            external_config: self.external_config.as_deref(),
            tls: self.tls.as_ref(),
            acl: self.acl.as_ref(),
        }
    }

    fn acl_enabled(&self) -> bool {
        self.acl.as_ref().is_some_and(|acl| acl.secret.is_some())
    }

    fn enabled_exporter(&self) -> Option<&RedisExporter> {
        self.exporter.as_ref().filter(|e| e.enabled)
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() { None } else { Some(items) }
}

fn non_empty_map(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map.clone())
    }
}

/// Generate the desired StatefulSet.
pub fn generate_statefulset(params: &WorkloadParams) -> StatefulSet {
    let mode = params.mode;

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            namespace: params.namespace.clone(),
            labels: non_empty_map(&params.labels),
            annotations: non_empty_map(&params.annotations),
            owner_references: params.owner.clone().map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(params.replicas),
            service_name: Some(headless_service_name(&params.name)),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&params.name, mode)),
                ..Default::default()
            },
            update_strategy: params.update_strategy.clone(),
            template: generate_pod_template(params),
            volume_claim_templates: claim_templates(
                &params.name,
                params.storage.as_ref(),
                &params.labels,
                &params.annotations,
            ),
            ..Default::default()
        }),
        status: None,
    }
}

fn generate_pod_template(params: &WorkloadParams) -> PodTemplateSpec {
    let mut containers = vec![generate_main_container(params)];
    if let Some(exporter) = params.enabled_exporter() {
        containers.push(generate_exporter_container(params, exporter));
    }
    containers.extend(params.sidecars.iter().map(generate_sidecar_container));

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: non_empty_map(&params.labels),
            annotations: non_empty_map(&params.annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers,
            init_containers: params
                .init_container
                .as_ref()
                .filter(|init| init.enabled)
                .map(|init| vec![generate_init_container(params, init)]),
            node_selector: params.node_selector.clone().filter(|m| !m.is_empty()),
            security_context: params.pod_security_context.clone(),
            priority_class_name: params
                .priority_class_name
                .clone()
                .filter(|p| !p.is_empty()),
            affinity: params.affinity.clone(),
            termination_grace_period_seconds: params.termination_grace_period_seconds,
            tolerations: params.tolerations.clone().filter(|t| !t.is_empty()),
            image_pull_secrets: params.image_pull_secrets.clone().filter(|s| !s.is_empty()),
            volumes: non_empty(pod_volumes(&params.volume_inputs())),
            service_account_name: params
                .service_account_name
                .clone()
                .filter(|s| !s.is_empty()),
            ..Default::default()
        }),
    }
}

fn env_inputs<'a>(params: &'a WorkloadParams, exporter: bool, extra: &'a [EnvVar]) -> EnvInputs<'a> {
    EnvInputs {
        mode: params.mode,
        exporter,
        password: params.password_secret.as_ref(),
        persistence: params.storage.is_some(),
        tls: params.tls.as_ref(),
        acl: params.acl_enabled(),
        extra,
    }
}

fn generate_main_container(params: &WorkloadParams) -> Container {
    let mode = params.mode;

    Container {
        name: params.name.clone(),
        image: Some(params.image.clone()),
        image_pull_policy: params.image_pull_policy.clone(),
        security_context: params.security_context.clone(),
        ports: Some(vec![ContainerPort {
            container_port: mode.port(),
            name: Some(mode.port_name().to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(generate_env_vars(&env_inputs(
            params,
            false,
            &params.extra_env,
        ))),
        resources: params.resources.clone(),
        readiness_probe: Some(generate_probe(&params.readiness_probe)),
        liveness_probe: Some(generate_probe(&params.liveness_probe)),
        volume_mounts: non_empty(volume_mounts(&params.volume_inputs())),
        ..Default::default()
    }
}

fn generate_exporter_container(params: &WorkloadParams, exporter: &RedisExporter) -> Container {
    let extra = exporter.env.clone().unwrap_or_default();

    Container {
        name: EXPORTER_CONTAINER.to_string(),
        image: Some(exporter.image.clone()),
        image_pull_policy: exporter.image_pull_policy.clone(),
        ports: Some(vec![ContainerPort {
            container_port: EXPORTER_PORT,
            name: Some(EXPORTER_CONTAINER.to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(generate_env_vars(&env_inputs(params, true, &extra))),
        resources: exporter.resources.clone(),
        volume_mounts: non_empty(volume_mounts(&params.volume_inputs())),
        ..Default::default()
    }
}

fn generate_init_container(params: &WorkloadParams, init: &InitContainer) -> Container {
    Container {
        name: format!("init{}", params.name),
        image: Some(init.image.clone()),
        image_pull_policy: init.image_pull_policy.clone(),
        command: init.command.clone().filter(|c| !c.is_empty()),
        args: init.args.clone().filter(|a| !a.is_empty()),
        env: init.env.clone().filter(|e| !e.is_empty()),
        resources: init.resources.clone(),
        volume_mounts: non_empty(volume_mounts(&params.volume_inputs())),
        ..Default::default()
    }
}

fn generate_sidecar_container(sidecar: &Sidecar) -> Container {
    Container {
        name: sidecar.name.clone(),
        image: Some(sidecar.image.clone()),
        image_pull_policy: sidecar.image_pull_policy.clone(),
        command: sidecar.command.clone().filter(|c| !c.is_empty()),
        ports: sidecar.ports.clone().filter(|p| !p.is_empty()),
        volume_mounts: sidecar.volume_mounts.clone().filter(|m| !m.is_empty()),
        env: sidecar.env.clone().filter(|e| !e.is_empty()),
        resources: sidecar.resources.clone(),
        ..Default::default()
    }
}

/// Exec probe running the image's health check script.
pub fn generate_probe(probe: &Probe) -> K8sProbe {
    K8sProbe {
        exec: Some(ExecAction {
            command: Some(HEALTHCHECK_COMMAND.iter().map(|s| s.to_string()).collect()),
        }),
        initial_delay_seconds: Some(probe.initial_delay_seconds),
        timeout_seconds: Some(probe.timeout_seconds),
        period_seconds: Some(probe.period_seconds),
        success_threshold: Some(probe.success_threshold),
        failure_threshold: Some(probe.failure_threshold),
        ..Default::default()
    }
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
    use crate::resources::common::workload_labels;

    fn test_params(name: &str) -> WorkloadParams {
        WorkloadParams {
            name: name.to_string(),
            namespace: Some("default".to_string()),
            mode: SetupMode::Replication,
            replicas: 3,
            labels: workload_labels(name, SetupMode::Replication, &BTreeMap::new()),
            image: "redis:7".to_string(),
            ..Default::default()
        }
    }

    fn pod_spec(sts: &StatefulSet) -> &PodSpec {
        sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    #[test]
    fn test_generate_statefulset_basics() {
        let sts = generate_statefulset(&test_params("cache"));
        let spec = sts.spec.as_ref().unwrap();

        assert_eq!(sts.metadata.name.as_deref(), Some("cache"));
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name.as_deref(), Some("cache-headless"));
        assert_eq!(
            spec.selector.match_labels.as_ref().unwrap().get("role").unwrap(),
            "replication"
        );
        assert!(spec.volume_claim_templates.is_none());

        let containers = &pod_spec(&sts).containers;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "cache");
        assert_eq!(containers[0].ports.as_ref().unwrap()[0].container_port, 6379);
        assert!(pod_spec(&sts).init_containers.is_none());
        assert!(pod_spec(&sts).volumes.is_none());
    }

    #[test]
    fn test_generation_is_deterministic() {
        let params = test_params("cache");
        let a = serde_json::to_string(&generate_statefulset(&params)).unwrap();
        let b = serde_json::to_string(&generate_statefulset(&params)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_probe_thresholds() {
        let probe = generate_probe(&Probe {
            initial_delay_seconds: 5,
            failure_threshold: 6,
            ..Default::default()
        });
        assert_eq!(
            probe.exec.unwrap().command.unwrap(),
            vec!["bash", "/usr/bin/healthcheck.sh"]
        );
        assert_eq!(probe.initial_delay_seconds, Some(5));
        assert_eq!(probe.timeout_seconds, Some(1));
        assert_eq!(probe.period_seconds, Some(10));
        assert_eq!(probe.failure_threshold, Some(6));
    }

    #[test]
    fn test_exporter_init_and_sidecars() {
        let mut params = test_params("cache");
        params.exporter = Some(RedisExporter {
            enabled: true,
            image: "oliver006/redis_exporter:v1.55.0".to_string(),
            env: Some(vec![EnvVar {
                name: "REDIS_EXPORTER_INCL_SYSTEM_METRICS".to_string(),
                value: Some("true".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        params.init_container = Some(InitContainer {
            enabled: true,
            image: "busybox".to_string(),
            command: Some(vec!["sh".to_string(), "-c".to_string()]),
            ..Default::default()
        });
        params.sidecars = vec![Sidecar {
            name: "log-shipper".to_string(),
            image: "fluent-bit".to_string(),
            ..Default::default()
        }];

        let sts = generate_statefulset(&params);
        let pod = pod_spec(&sts);
        let names: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["cache", "redis-exporter", "log-shipper"]);

        let exporter_env = pod.containers[1].env.as_ref().unwrap();
        assert!(
            exporter_env
                .iter()
                .any(|e| e.name == "REDIS_EXPORTER_INCL_SYSTEM_METRICS")
        );
        let main_env = pod.containers[0].env.as_ref().unwrap();
        assert!(
            !main_env
                .iter()
                .any(|e| e.name == "REDIS_EXPORTER_INCL_SYSTEM_METRICS")
        );

        let init = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, "initcache");
        assert_eq!(init.command.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_disabled_extras_are_omitted() {
        let mut params = test_params("cache");
        params.exporter = Some(RedisExporter {
            enabled: false,
            ..Default::default()
        });
        params.init_container = Some(InitContainer::default());
        params.priority_class_name = Some(String::new());

        let sts = generate_statefulset(&params);
        let pod = pod_spec(&sts);
        assert_eq!(pod.containers.len(), 1);
        assert!(pod.init_containers.is_none());
        assert!(pod.priority_class_name.is_none());
    }
}
