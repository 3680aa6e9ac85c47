//! Patch planning between a desired and an observed object.
//!
//! The plan is an RFC 6902 JSON Patch computed after masking fields that
//! carry no meaning for convergence: server bookkeeping (`resourceVersion`,
//! `managedFields`, ...), `status`, and the planner's own last-applied
//! annotation. The observed object is projected onto the desired object's
//! shape first, so fields the server defaulted do not register as drift.
//!
//! Fields that were declared by the previous apply (recorded in the
//! last-applied annotation) but are no longer desired are kept in the
//! projection, which turns them into removals.
//!
//! Resource quantities are compared by amount: the server stores them in
//! canonical notation (`1000m` comes back as `1`), which is not drift.

use json_patch::Patch;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::controller::error::Result;
use crate::resources::common::same_quantity;

/// Annotation holding the masked desired object of the last apply.
pub const LAST_APPLIED_ANNOTATION: &str = "redis.opstreelabs.in/last-applied";

const MASKED_METADATA: [&str; 6] = [
    "resourceVersion",
    "creationTimestamp",
    "managedFields",
    "uid",
    "generation",
    "selfLink",
];

const MASKED_TOP_LEVEL: [&str; 3] = ["status", "kind", "apiVersion"];

/// Keys whose values are maps of resource name to quantity.
const QUANTITY_MAPS: [&str; 3] = ["requests", "limits", "capacity"];

/// Difference between a desired and an observed object.
#[derive(Debug, Clone)]
pub struct PatchPlan {
    patch: Patch,
}

impl PatchPlan {
    /// True when the objects agree on every semantic field.
    pub fn is_empty(&self) -> bool {
        self.patch.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patch.0.len()
    }

    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    /// JSON Pointer paths touched by the plan.
    pub fn paths(&self) -> Vec<String> {
        serde_json::to_value(&self.patch)
            .ok()
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
            .iter()
            .filter_map(|op| op.get("path").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

/// Compute the plan turning `observed` into `desired`.
pub fn plan<T: Serialize>(observed: &T, desired: &T) -> Result<PatchPlan> {
    let observed = serde_json::to_value(observed)?;
    let last_applied = last_applied(&observed);
    let observed = mask(observed);
    let desired = mask(serde_json::to_value(desired)?);

    let projected = project(&observed, &desired, last_applied.as_ref());
    Ok(PatchPlan {
        patch: json_patch::diff(&projected, &desired),
    })
}

/// Record `object` (masked) in its own last-applied annotation.
pub fn last_applied_value<T: Serialize>(object: &T) -> Result<String> {
    let masked = mask(serde_json::to_value(object)?);
    Ok(serde_json::to_string(&masked)?)
}

fn last_applied(observed: &Value) -> Option<Value> {
    observed
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str(s).ok())
}

/// Strip non-semantic fields from a serialized object.
fn mask(mut value: Value) -> Value {
    mask_object(&mut value);
    if let Some(templates) = value
        .pointer_mut("/spec/volumeClaimTemplates")
        .and_then(Value::as_array_mut)
    {
        templates.iter_mut().for_each(mask_object);
    }
    value
}

fn mask_object(value: &mut Value) {
    let Some(object) = value.as_object_mut() else {
        return;
    };
    for key in MASKED_TOP_LEVEL {
        object.remove(key);
    }
    if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        for key in MASKED_METADATA {
            metadata.remove(key);
        }
        let empty = metadata
            .get_mut("annotations")
            .and_then(Value::as_object_mut)
            .map(|annotations| {
                annotations.remove(LAST_APPLIED_ANNOTATION);
                annotations.is_empty()
            })
            .unwrap_or(false);
        if empty {
            metadata.remove("annotations");
        }
    }
}

/// Project `observed` onto the shape of `desired`.
///
/// Keys absent from `desired` survive only if `last` (the previous apply)
/// declared them. Arrays are projected element-wise over their common
/// prefix.
fn project(observed: &Value, desired: &Value, last: Option<&Value>) -> Value {
    match (observed, desired) {
        (Value::Object(obs), Value::Object(des)) => {
            let mut out = Map::new();
            for (key, obs_value) in obs {
                let last_value = last.and_then(|l| l.get(key));
                match des.get(key) {
                    Some(des_value) if QUANTITY_MAPS.contains(&key.as_str()) => {
                        let projected = project(obs_value, des_value, last_value);
                        out.insert(key.clone(), adopt_notation(projected, des_value));
                    }
                    Some(des_value) => {
                        out.insert(key.clone(), project(obs_value, des_value, last_value));
                    }
                    None if last_value.is_some() => {
                        out.insert(key.clone(), obs_value.clone());
                    }
                    None => {}
                }
            }
            Value::Object(out)
        }
        (Value::Array(obs), Value::Array(des)) => Value::Array(
            obs.iter()
                .enumerate()
                .map(|(i, obs_value)| match des.get(i) {
                    Some(des_value) => {
                        project(obs_value, des_value, last.and_then(|l| l.get(i)))
                    }
                    None => obs_value.clone(),
                })
                .collect(),
        ),
        _ => observed.clone(),
    }
}

/// Replace observed quantities with the desired string when both denote
/// the same amount.
fn adopt_notation(mut projected: Value, desired: &Value) -> Value {
    if let (Some(projected_map), Some(desired_map)) =
        (projected.as_object_mut(), desired.as_object())
    {
        for (name, observed) in projected_map.iter_mut() {
            if let (Some(obs), Some(des)) = (
                observed.as_str(),
                desired_map.get(name).and_then(Value::as_str),
            ) && obs != des
                && same_quantity(&Quantity(obs.to_string()), &Quantity(des.to_string()))
            {
                *observed = Value::String(des.to_string());
            }
        }
    }
    projected
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
    use serde_json::json;

    #[test]
    fn test_identical_objects_give_empty_plan() {
        let object = json!({"metadata": {"name": "cache"}, "spec": {"replicas": 3}});
        assert!(plan(&object, &object).unwrap().is_empty());
    }

    #[test]
    fn test_bookkeeping_and_status_are_masked() {
        let desired = json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": {"name": "cache"},
            "spec": {"replicas": 3}
        });
        let observed = json!({
            "metadata": {
                "name": "cache",
                "resourceVersion": "42",
                "uid": "abc",
                "generation": 7,
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "managedFields": [{"manager": "kubectl"}]
            },
            "spec": {"replicas": 3},
            "status": {"readyReplicas": 2}
        });
        assert!(plan(&observed, &desired).unwrap().is_empty());
    }

    #[test]
    fn test_server_defaults_are_ignored() {
        let desired = json!({"spec": {"template": {"spec": {"containers": [{"name": "redis"}]}}}});
        let observed = json!({"spec": {
            "podManagementPolicy": "OrderedReady",
            "template": {"spec": {
                "restartPolicy": "Always",
                "containers": [{"name": "redis", "terminationMessagePath": "/dev/termination-log"}]
            }}
        }});
        assert!(plan(&observed, &desired).unwrap().is_empty());
    }

    #[test]
    fn test_claim_template_bookkeeping_is_masked() {
        let desired = json!({"spec": {"volumeClaimTemplates": [
            {"metadata": {"name": "cache"}, "spec": {"accessModes": ["ReadWriteOnce"]}}
        ]}});
        let observed = json!({"spec": {"volumeClaimTemplates": [{
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {"name": "cache", "creationTimestamp": null},
            "spec": {"accessModes": ["ReadWriteOnce"]},
            "status": {"phase": "Pending"}
        }]}});
        assert!(plan(&observed, &desired).unwrap().is_empty());
    }

    #[test]
    fn test_changed_field_is_planned() {
        let observed = json!({"spec": {"replicas": 3, "serviceName": "cache-headless"}});
        let desired = json!({"spec": {"replicas": 5, "serviceName": "cache-headless"}});
        let plan = plan(&observed, &desired).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.paths(), vec!["/spec/replicas"]);
    }

    #[test]
    fn test_env_order_is_significant() {
        let observed = json!({"env": [{"name": "A"}, {"name": "B"}]});
        let desired = json!({"env": [{"name": "B"}, {"name": "A"}]});
        assert!(!plan(&observed, &desired).unwrap().is_empty());
    }

    #[test]
    fn test_previously_applied_field_is_removed() {
        let previous = json!({"metadata": {"labels": {"team": "a"}}, "spec": {"replicas": 3}});
        let mut observed = previous.clone();
        observed["metadata"]["annotations"] = json!({
            LAST_APPLIED_ANNOTATION: last_applied_value(&previous).unwrap()
        });
        // Defaulted by the server, never applied.
        observed["spec"]["revisionHistoryLimit"] = json!(10);

        let desired = json!({"metadata": {}, "spec": {"replicas": 3}});
        let plan = plan(&observed, &desired).unwrap();
        assert_eq!(plan.paths(), vec!["/metadata/labels"]);
    }

    #[test]
    fn test_last_applied_annotation_is_masked() {
        let desired = json!({"metadata": {"annotations": {
            LAST_APPLIED_ANNOTATION: "{\"spec\":{}}",
            "storageCapacity": "1073741824"
        }}});
        let observed = json!({"metadata": {"annotations": {
            LAST_APPLIED_ANNOTATION: "{\"spec\":{\"old\":true}}",
            "storageCapacity": "1073741824"
        }}});
        assert!(plan(&observed, &desired).unwrap().is_empty());
    }

    #[test]
    fn test_canonical_quantities_are_not_drift() {
        let desired = json!({"resources": {
            "requests": {"cpu": "1000m", "memory": "1024Mi"},
            "limits": {"cpu": "2", "memory": "2Gi"}
        }});
        let observed = json!({"resources": {
            "requests": {"cpu": "1", "memory": "1Gi"},
            "limits": {"cpu": "2", "memory": "2Gi"}
        }});
        assert!(plan(&observed, &desired).unwrap().is_empty());
    }

    #[test]
    fn test_changed_quantity_is_planned() {
        let desired = json!({"resources": {"requests": {"cpu": "500m", "memory": "2Gi"}}});
        let observed = json!({"resources": {"requests": {"cpu": "1", "memory": "1Gi"}}});
        let plan = plan(&observed, &desired).unwrap();
        assert_eq!(
            plan.paths(),
            vec!["/resources/requests/cpu", "/resources/requests/memory"]
        );
    }

    #[test]
    fn test_quantity_notation_outside_resource_maps_is_significant() {
        let observed = json!({"metadata": {"annotations": {"size": "1Gi"}}});
        let desired = json!({"metadata": {"annotations": {"size": "1024Mi"}}});
        assert!(!plan(&observed, &desired).unwrap().is_empty());
    }

    #[test]
    fn test_array_length_change_is_planned() {
        let observed = json!({"containers": [{"name": "redis", "defaulted": true}]});
        let desired = json!({"containers": [{"name": "redis"}, {"name": "exporter"}]});
        let plan = plan(&observed, &desired).unwrap();
        assert_eq!(plan.paths(), vec!["/containers/1"]);
    }
}
