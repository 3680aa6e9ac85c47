//! PodDisruptionBudget generation for Sentinel workloads.
//!
//! Keeps enough sentinels up during voluntary disruptions (node drains,
//! upgrades) to preserve the failover quorum.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::RedisPodDisruptionBudget;
use crate::resources::common::selector_labels;
use crate::resources::statefulset::WorkloadParams;

/// Generate a PodDisruptionBudget, or `None` when disabled.
///
/// Without explicit bounds, `maxUnavailable = replicas / 2`, which keeps a
/// majority of the workload running.
pub fn generate_pod_disruption_budget(
    params: &WorkloadParams,
    config: Option<&RedisPodDisruptionBudget>,
) -> Option<PodDisruptionBudget> {
    let config = config.filter(|c| c.enabled)?;

    let (min_available, max_unavailable) = match (config.min_available, config.max_unavailable) {
        (Some(min), _) => (Some(IntOrString::Int(min)), None),
        (None, Some(max)) => (None, Some(IntOrString::Int(max))),
        (None, None) => (None, Some(IntOrString::Int((params.replicas / 2).max(1)))),
    };

    Some(PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            namespace: params.namespace.clone(),
            labels: Some(params.labels.clone()),
            owner_references: params.owner.clone().map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available,
            max_unavailable,
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(&params.name, params.mode)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    })
}
