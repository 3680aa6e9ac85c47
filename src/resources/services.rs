//! Service generation for Redis and Sentinel workloads.
//!
//! Each workload gets three services:
//! - **Headless Service**: stable per-pod DNS names
//! - **Client Service**: load-balanced ClusterIP endpoint
//! - **Additional Service**: user-configurable type and annotations

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::ServiceConfig;
use crate::resources::common::{
    EXPORTER_PORT, additional_service_name, headless_service_name, selector_labels,
};
use crate::resources::statefulset::WorkloadParams;

fn service_ports(params: &WorkloadParams) -> Vec<ServicePort> {
    let mut ports = vec![ServicePort {
        name: Some(params.mode.port_name().to_string()),
        port: params.mode.port(),
        target_port: Some(IntOrString::Int(params.mode.port())),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];

    if params.exporter.as_ref().is_some_and(|e| e.enabled) {
        ports.push(ServicePort {
            name: Some("redis-exporter".to_string()),
            port: EXPORTER_PORT,
            target_port: Some(IntOrString::Int(EXPORTER_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }

    ports
}

fn service(params: &WorkloadParams, name: String, spec: ServiceSpec) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: params.namespace.clone(),
            labels: Some(params.labels.clone()),
            annotations: if params.annotations.is_empty() {
                None
            } else {
                Some(params.annotations.clone())
            },
            owner_references: params.owner.clone().map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&params.name, params.mode)),
            ports: Some(service_ports(params)),
            ..spec
        }),
        status: None,
    }
}

/// Headless service backing the StatefulSet's `serviceName`.
pub fn generate_headless_service(params: &WorkloadParams) -> Service {
    service(
        params,
        headless_service_name(&params.name),
        ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        },
    )
}

/// ClusterIP service named after the workload.
pub fn generate_client_service(params: &WorkloadParams) -> Service {
    service(
        params,
        params.name.clone(),
        ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        },
    )
}

/// Service whose type and annotations come from the resource's service config.
pub fn generate_additional_service(
    params: &WorkloadParams,
    config: Option<&ServiceConfig>,
) -> Service {
    let config = config.cloned().unwrap_or_default();
    let mut svc = service(
        params,
        additional_service_name(&params.name),
        ServiceSpec {
            type_: Some(config.service_type.clone()),
            ..Default::default()
        },
    );
    if !config.annotations.is_empty() {
        svc.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .extend(config.annotations);
    }
    svc
}

/// All services of a workload, in apply order.
pub fn generate_services(params: &WorkloadParams, config: Option<&ServiceConfig>) -> Vec<Service> {
    vec![
        generate_headless_service(params),
        generate_client_service(params),
        generate_additional_service(params, config),
    ]
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
    use crate::crd::RedisExporter;
    use crate::resources::common::{SetupMode, workload_labels};
    use std::collections::BTreeMap;

    fn test_params(mode: SetupMode) -> WorkloadParams {
        WorkloadParams {
            name: "rs-sentinel".to_string(),
            namespace: Some("default".to_string()),
            mode,
            labels: workload_labels("rs-sentinel", mode, &BTreeMap::new()),
            ..Default::default()
        }
    }

    #[test]
    fn test_headless_service() {
        let svc = generate_headless_service(&test_params(SetupMode::Sentinel));
        let spec = svc.spec.unwrap();
        assert_eq!(svc.metadata.name.as_deref(), Some("rs-sentinel-headless"));
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 26379);
        assert_eq!(
            spec.selector.unwrap().get("role").unwrap(),
            "sentinel"
        );
    }

    #[test]
    fn test_client_service_with_exporter() {
        let mut params = test_params(SetupMode::Replication);
        params.exporter = Some(RedisExporter {
            enabled: true,
            ..Default::default()
        });
        let svc = generate_client_service(&params);
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        let ports: Vec<_> = spec.ports.unwrap().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![6379, 9121]);
    }

    #[test]
    fn test_additional_service_config() {
        let params = test_params(SetupMode::Replication);
        let config = ServiceConfig {
            service_type: "LoadBalancer".to_string(),
            annotations: BTreeMap::from([(
                "service.beta.kubernetes.io/aws-load-balancer-internal".to_string(),
                "true".to_string(),
            )]),
        };
        let svc = generate_additional_service(&params, Some(&config));
        assert_eq!(
            svc.metadata.name.as_deref(),
            Some("rs-sentinel-additional")
        );
        assert_eq!(svc.spec.unwrap().type_.as_deref(), Some("LoadBalancer"));
        assert!(
            svc.metadata
                .annotations
                .unwrap()
                .contains_key("service.beta.kubernetes.io/aws-load-balancer-internal")
        );

        let default = generate_additional_service(&params, None);
        assert_eq!(default.spec.unwrap().type_.as_deref(), Some("ClusterIP"));
    }

    #[test]
    fn test_generate_services_order() {
        let services = generate_services(&test_params(SetupMode::Replication), None);
        let names: Vec<_> = services
            .iter()
            .map(|s| s.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["rs-sentinel-headless", "rs-sentinel", "rs-sentinel-additional"]
        );
    }
}
