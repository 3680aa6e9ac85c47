//! Common resource generation utilities.
//!
//! Naming, labels, annotations and owner references shared by every object
//! the operator generates, plus Kubernetes quantity parsing.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

/// Name of this operator, used for `managed-by` and as field manager.
pub const OPERATOR_NAME: &str = "redis-sentinel-operator";

/// Port served by Redis replicas.
pub const REDIS_PORT: i32 = 6379;
/// Port served by Sentinel processes.
pub const SENTINEL_PORT: i32 = 26379;
/// Port served by the exporter sidecar.
pub const EXPORTER_PORT: i32 = 9121;

pub const LABEL_APP: &str = "app";
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_SETUP_TYPE: &str = "redis_setup_type";
pub const LABEL_ROLE: &str = "role";

/// Component label value shared by all workloads.
pub const COMPONENT_REDIS: &str = "redis";

pub const ANNOTATION_MANAGED: &str = "redis.opstreelabs.in";
pub const ANNOTATION_INSTANCE: &str = "redis.opstreelabs.instance";
/// Opt-in for deleting and recreating a workload whose update is rejected.
pub const ANNOTATION_RECREATE: &str = "redis.opstreelabs.in/recreate-statefulset";

const KUBECTL_LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// How a workload's processes are set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SetupMode {
    #[default]
    Replication,
    Sentinel,
}

impl SetupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupMode::Replication => "replication",
            SetupMode::Sentinel => "sentinel",
        }
    }

    /// Port the main container listens on.
    pub fn port(&self) -> i32 {
        match self {
            SetupMode::Replication => REDIS_PORT,
            SetupMode::Sentinel => SENTINEL_PORT,
        }
    }

    pub fn port_name(&self) -> &'static str {
        match self {
            SetupMode::Replication => "redis-client",
            SetupMode::Sentinel => "sentinel-client",
        }
    }
}

impl std::fmt::Display for SetupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workload name of a RedisSentinel.
pub fn sentinel_workload_name(resource_name: &str) -> String {
    format!("{}-sentinel", resource_name)
}

pub fn headless_service_name(workload: &str) -> String {
    format!("{}-headless", workload)
}

pub fn additional_service_name(workload: &str) -> String {
    format!("{}-additional", workload)
}

/// Stable pod name for a replica ordinal.
pub fn pod_name(workload: &str, ordinal: i32) -> String {
    format!("{}-{}", workload, ordinal)
}

/// Labels applied to a workload, its pods, claims and services.
///
/// User labels are merged first so the operator's own keys always win.
pub fn workload_labels(
    workload: &str,
    mode: SetupMode,
    user_labels: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = user_labels.clone();
    labels.extend(selector_labels(workload, mode));
    labels.insert(LABEL_MANAGED_BY.to_string(), OPERATOR_NAME.to_string());
    labels.insert(LABEL_SETUP_TYPE.to_string(), mode.as_str().to_string());
    labels
}

/// Stable label subset used as pod selector.
pub fn selector_labels(workload: &str, mode: SetupMode) -> BTreeMap<String, String> {
    let mut labels = claim_selector_labels(workload);
    labels.insert(LABEL_ROLE.to_string(), mode.as_str().to_string());
    labels
}

/// Labels identifying the volume claims of a workload.
pub fn claim_selector_labels(workload: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), workload.to_string()),
        (LABEL_COMPONENT.to_string(), COMPONENT_REDIS.to_string()),
        (LABEL_NAME.to_string(), workload.to_string()),
    ])
}

/// Render labels as a Kubernetes label selector string.
pub fn label_selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Annotations applied to a workload and its pod template.
pub fn workload_annotations(
    resource_name: &str,
    user_annotations: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::from([
        (ANNOTATION_MANAGED.to_string(), "true".to_string()),
        (ANNOTATION_INSTANCE.to_string(), resource_name.to_string()),
    ]);
    for (key, value) in user_annotations {
        if key == KUBECTL_LAST_APPLIED || key == ANNOTATION_RECREATE {
            continue;
        }
        annotations.insert(key.clone(), value.clone());
    }
    annotations
}

/// Whether the resource opted into delete-and-recreate on rejected updates.
pub fn recreate_requested<K: Resource>(resource: &K) -> bool {
    resource
        .annotations()
        .get(ANNOTATION_RECREATE)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Controller owner reference pointing at `resource`.
pub fn owner_reference<K>(resource: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: resource.name_any(),
        uid: resource.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Parse a Kubernetes quantity into a whole number of base units,
/// rounding up like `Quantity.Value()`.
///
/// Supports binary (`Ki`..`Ei`) and decimal (`n`..`E`) suffixes and
/// exponent notation (`1e9`).
pub fn parse_quantity(quantity: &Quantity) -> Option<i64> {
    quantity_amount(quantity).and_then(to_units)
}

/// Whether two quantities denote the same amount in any notation, so that
/// `1000m` equals `1` and `1024Mi` equals `1Gi`.
pub fn same_quantity(a: &Quantity, b: &Quantity) -> bool {
    match (quantity_amount(a), quantity_amount(b)) {
        (Some(a), Some(b)) => {
            let scale = a.abs().max(b.abs()).max(f64::MIN_POSITIVE);
            (a - b).abs() <= scale * 1e-12
        }
        _ => false,
    }
}

/// Exact amount of a quantity in base units, fractions included.
fn quantity_amount(quantity: &Quantity) -> Option<f64> {
    let s = quantity.0.trim();
    if s.is_empty() {
        return None;
    }

    const BINARY: [(&str, i32); 6] = [
        ("Ki", 10),
        ("Mi", 20),
        ("Gi", 30),
        ("Ti", 40),
        ("Pi", 50),
        ("Ei", 60),
    ];
    for (suffix, shift) in BINARY {
        if let Some(number) = s.strip_suffix(suffix) {
            let value: f64 = number.parse().ok()?;
            return Some(value * 2f64.powi(shift));
        }
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let value: f64 = number.parse().ok()?;

    let exponent = match suffix {
        "" => 0,
        "n" => -9,
        "u" => -6,
        "m" => -3,
        "k" => 3,
        "M" => 6,
        "G" => 9,
        "T" => 12,
        "P" => 15,
        "E" => 18,
        other => {
            let digits = other.strip_prefix(['e', 'E'])?;
            digits.parse::<i32>().ok()?
        }
    };

    Some(value * 10f64.powi(exponent))
}

fn to_units(value: f64) -> Option<i64> {
    let rounded = value.ceil();
    if rounded.is_finite() && rounded >= i64::MIN as f64 && rounded <= i64::MAX as f64 {
        Some(rounded as i64)
    } else {
        None
    }
}

/// Requested storage of a claim (or claim template) in bytes.
pub fn storage_request_bytes(claim: &PersistentVolumeClaim) -> Option<i64> {
    claim
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .and_then(parse_quantity)
}

/// Size of a claim: its request, or the provisioned capacity when unset.
pub fn claim_capacity_bytes(claim: &PersistentVolumeClaim) -> Option<i64> {
    storage_request_bytes(claim).or_else(|| {
        claim
            .status
            .as_ref()?
            .capacity
            .as_ref()?
            .get("storage")
            .and_then(parse_quantity)
    })
}
