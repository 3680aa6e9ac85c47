//! Volumes, mounts and claim templates for Redis workloads.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec, SecretVolumeSource,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::{AclConfig, Storage, TlsConfig};
use crate::resources::env::TLS_MOUNT_PATH;

pub const NODE_CONF_VOLUME: &str = "node-conf";
pub const NODE_CONF_MOUNT_PATH: &str = "/node-conf";
pub const DATA_MOUNT_PATH: &str = "/data";
pub const TLS_VOLUME: &str = "tls-certs";
pub const ACL_VOLUME: &str = "acl-secret";
pub const ACL_MOUNT_PATH: &str = "/etc/redis/user.acl";
pub const ACL_FILE: &str = "user.acl";
pub const EXTERNAL_CONFIG_VOLUME: &str = "external-config";
pub const EXTERNAL_CONFIG_MOUNT_PATH: &str = "/etc/redis/external.conf.d";

/// Inputs shared by the mount and volume generators.
#[derive(Debug, Clone, Copy)]
pub struct VolumeInputs<'a> {
    /// Workload name; also the name of the data volume.
    pub workload: &'a str,
    pub storage: Option<&'a Storage>,
    pub external_config: Option<&'a str>,
    pub tls: Option<&'a TlsConfig>,
    pub acl: Option<&'a AclConfig>,
}

impl VolumeInputs<'_> {
    fn node_conf(&self) -> bool {
        self.storage.is_some_and(|s| s.node_conf_volume)
    }

    fn acl_secret(&self) -> Option<&SecretVolumeSource> {
        self.acl.and_then(|acl| acl.secret.as_ref())
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

/// Mounts for the Redis (or Sentinel) container.
pub fn volume_mounts(inputs: &VolumeInputs<'_>) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();

    if inputs.node_conf() {
        mounts.push(mount(NODE_CONF_VOLUME, NODE_CONF_MOUNT_PATH));
    }

    if inputs.storage.is_some() {
        mounts.push(mount(inputs.workload, DATA_MOUNT_PATH));
    }

    if inputs.tls.is_some() {
        mounts.push(VolumeMount {
            read_only: Some(true),
            ..mount(TLS_VOLUME, TLS_MOUNT_PATH)
        });
    }

    if inputs.acl_secret().is_some() {
        mounts.push(VolumeMount {
            sub_path: Some(ACL_FILE.to_string()),
            ..mount(ACL_VOLUME, ACL_MOUNT_PATH)
        });
    }

    if inputs.external_config.is_some() {
        mounts.push(mount(EXTERNAL_CONFIG_VOLUME, EXTERNAL_CONFIG_MOUNT_PATH));
    }

    if let Some(extra) = inputs.storage.and_then(|s| s.volume_mount.as_ref()) {
        mounts.extend(extra.mount_path.iter().cloned());
    }

    mounts
}

/// Pod-level volumes. Claim-backed volumes come from the claim templates.
pub fn pod_volumes(inputs: &VolumeInputs<'_>) -> Vec<Volume> {
    let mut volumes = Vec::new();

    if let Some(config_map) = inputs.external_config {
        volumes.push(Volume {
            name: EXTERNAL_CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    if let Some(extra) = inputs.storage.and_then(|s| s.volume_mount.as_ref()) {
        volumes.extend(extra.volume.iter().cloned());
    }

    if let Some(tls) = inputs.tls {
        volumes.push(Volume {
            name: TLS_VOLUME.to_string(),
            secret: Some(tls.secret.clone()),
            ..Default::default()
        });
    }

    if let Some(secret) = inputs.acl_secret() {
        volumes.push(Volume {
            name: ACL_VOLUME.to_string(),
            secret: Some(secret.clone()),
            ..Default::default()
        });
    }

    volumes
}

/// Claim template derived from a user template.
///
/// Access modes default to `ReadWriteOnce` and the volume mode to
/// `Filesystem`, the values the API server would fill in.
pub fn claim_template(
    volume_name: &str,
    template: &PersistentVolumeClaim,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> PersistentVolumeClaim {
    let user_spec = template.spec.clone().unwrap_or_default();

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(volume_name.to_string()),
            labels: Some(labels.clone()),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations.clone())
            },
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(
                user_spec
                    .access_modes
                    .clone()
                    .filter(|modes| !modes.is_empty())
                    .unwrap_or_else(|| vec!["ReadWriteOnce".to_string()]),
            ),
            volume_mode: Some(
                user_spec
                    .volume_mode
                    .clone()
                    .unwrap_or_else(|| "Filesystem".to_string()),
            ),
            ..user_spec
        }),
        status: None,
    }
}

/// Claim templates of a workload; the data template always comes first.
pub fn claim_templates(
    workload: &str,
    storage: Option<&Storage>,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> Option<Vec<PersistentVolumeClaim>> {
    let storage = storage?;
    let mut templates = vec![claim_template(
        workload,
        &storage.volume_claim_template,
        labels,
        annotations,
    )];

    if storage.node_conf_volume {
        let node_conf = storage
            .node_conf_volume_claim_template
            .as_ref()
            .unwrap_or(&storage.volume_claim_template);
        templates.push(claim_template(
            NODE_CONF_VOLUME,
            node_conf,
            labels,
            annotations,
        ));
    }

    Some(templates)
}
