//! Convergence of a stored StatefulSet towards its desired state.
//!
//! One pass fetches the stored object, coordinates claim capacity, plans a
//! patch and applies it as a full update guarded by the observed
//! `resourceVersion`. An update rejected as structurally invalid is only
//! recovered by delete-and-recreate when the resource opted in.

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::{Instrument, Span, debug, info, warn};

use crate::controller::capacity::{CapacityCoordinator, set_watermark, watermark};
use crate::controller::error::{Error, Result};
use crate::controller::patch::{LAST_APPLIED_ANNOTATION, last_applied_value, plan};
use crate::controller::store::StateStore;
use crate::resources::common::storage_request_bytes;

/// What a converge pass did to the stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergeOutcome {
    Created,
    Updated,
    Unchanged,
    Recreated,
}

impl std::fmt::Display for ConvergeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConvergeOutcome::Created => "Created",
            ConvergeOutcome::Updated => "Updated",
            ConvergeOutcome::Unchanged => "Unchanged",
            ConvergeOutcome::Recreated => "Recreated",
        };
        f.write_str(s)
    }
}

/// Outcome of a pass plus the claims resized on the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergeReport {
    pub outcome: ConvergeOutcome,
    pub resized_claims: usize,
}

impl ConvergeReport {
    fn new(outcome: ConvergeOutcome, resized_claims: usize) -> Self {
        Self {
            outcome,
            resized_claims,
        }
    }
}

/// Applies desired StatefulSets through a [`StateStore`].
///
/// Holds no state between passes; every call re-reads the stored object.
pub struct Converger<'a> {
    store: &'a dyn StateStore,
    span: Span,
    allow_recreate: bool,
}

impl<'a> Converger<'a> {
    /// `span` carries the identifying fields of the resource being reconciled.
    pub fn new(store: &'a dyn StateStore, span: Span) -> Self {
        Self {
            store,
            span,
            allow_recreate: false,
        }
    }

    /// Allow delete-and-recreate when an update is rejected as invalid.
    pub fn allow_recreate(mut self, allow: bool) -> Self {
        self.allow_recreate = allow;
        self
    }

    pub async fn converge(&self, namespace: &str, desired: StatefulSet) -> Result<ConvergeReport> {
        self.converge_inner(namespace, desired)
            .instrument(self.span.clone())
            .await
    }

    async fn converge_inner(
        &self,
        namespace: &str,
        mut desired: StatefulSet,
    ) -> Result<ConvergeReport> {
        let name = desired.name_any();

        let Some(observed) = self.store.get_statefulset(namespace, &name).await? else {
            set_last_applied(&mut desired)?;
            self.store.create_statefulset(namespace, &desired).await?;
            info!(statefulset = %name, "created statefulset");
            return Ok(ConvergeReport::new(ConvergeOutcome::Created, 0));
        };

        let resized_claims = self
            .reconcile_claim_templates(namespace, &observed, &mut desired)
            .await?;

        carry_forward_annotations(&observed, &mut desired);
        set_last_applied(&mut desired)?;

        let plan = plan(&observed, &desired)?;
        if plan.is_empty() {
            debug!(statefulset = %name, "statefulset unchanged");
            return Ok(ConvergeReport::new(ConvergeOutcome::Unchanged, resized_claims));
        }
        debug!(statefulset = %name, paths = ?plan.paths(), "statefulset drifted");

        desired.metadata.resource_version = observed.metadata.resource_version.clone();
        match self.store.update_statefulset(namespace, &desired).await {
            Ok(_) => {
                info!(statefulset = %name, operations = plan.len(), "updated statefulset");
                Ok(ConvergeReport::new(ConvergeOutcome::Updated, resized_claims))
            }
            Err(e) if e.is_invalid_structural() && self.allow_recreate => {
                warn!(statefulset = %name, error = %e, "update rejected, recreating statefulset");
                self.recreate(namespace, desired).await?;
                Ok(ConvergeReport::new(ConvergeOutcome::Recreated, resized_claims))
            }
            Err(e) => Err(e),
        }
    }

    /// Keep the stored claim templates and grow the claims behind them.
    ///
    /// Templates are only substituted when both sides declare the same number
    /// of them; any other shape change reaches the store and is rejected there.
    async fn reconcile_claim_templates(
        &self,
        namespace: &str,
        observed: &StatefulSet,
        desired: &mut StatefulSet,
    ) -> Result<usize> {
        let observed_templates = observed
            .spec
            .as_ref()
            .and_then(|s| s.volume_claim_templates.clone())
            .unwrap_or_default();
        let Some(desired_spec) = desired.spec.as_mut() else {
            return Ok(0);
        };
        let desired_templates = desired_spec.volume_claim_templates.clone().unwrap_or_default();
        if desired_templates.is_empty() || desired_templates.len() != observed_templates.len() {
            return Ok(0);
        }
        desired_spec.volume_claim_templates = Some(observed_templates);

        let mut resized = 0;
        let current = watermark(observed);
        let data_template = desired_templates.first();
        if let Some(template) = data_template
            && let Some(capacity) = storage_request_bytes(template)
            && capacity != current
        {
            if capacity < current {
                warn!(
                    watermark = current,
                    requested = capacity,
                    "volume claims cannot shrink, keeping capacity"
                );
            } else {
                let outcome = CapacityCoordinator::new(self.store, self.span.clone())
                    .reconcile_capacity(namespace, &desired.name_any(), template, current)
                    .await?;
                resized = outcome.resized;
                if outcome.confirmed() {
                    set_watermark(desired, capacity);
                }
            }
        }
        Ok(resized)
    }

    async fn recreate(&self, namespace: &str, mut desired: StatefulSet) -> Result<()> {
        let name = desired.name_any();
        self.store.delete_statefulset(namespace, &name).await?;

        desired.metadata.resource_version = None;
        match self.store.create_statefulset(namespace, &desired).await {
            Ok(_) => Ok(()),
            // Foreground deletion waits for the pods; the next pass creates it.
            Err(Error::Conflict { .. }) => Err(Error::Transient(format!(
                "statefulset {}/{} is still terminating",
                namespace, name
            ))),
            Err(e) => Err(e),
        }
    }
}

/// Copy stored annotations the desired object does not declare.
fn carry_forward_annotations(observed: &StatefulSet, desired: &mut StatefulSet) {
    let stored = observed.annotations();
    if stored.is_empty() {
        return;
    }
    let annotations = desired.annotations_mut();
    for (key, value) in stored {
        if key == LAST_APPLIED_ANNOTATION {
            continue;
        }
        annotations
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
}

fn set_last_applied(desired: &mut StatefulSet) -> Result<()> {
    desired.annotations_mut().remove(LAST_APPLIED_ANNOTATION);
    let value = last_applied_value(desired)?;
    desired
        .annotations_mut()
        .insert(LAST_APPLIED_ANNOTATION.to_string(), value);
    Ok(())
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
    use crate::controller::capacity::CAPACITY_ANNOTATION;
    use crate::controller::store::MockStateStore;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::ErrorResponse;
    use mockall::Sequence;
    use std::collections::BTreeMap;

    fn sts(replicas: i32) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("cache".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn stored(mut object: StatefulSet, version: &str) -> StatefulSet {
        set_last_applied(&mut object).unwrap();
        object.metadata.resource_version = Some(version.to_string());
        object
    }

    fn invalid() -> Error {
        Error::from_store(
            "StatefulSet",
            "cache",
            kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "spec: Forbidden: updates to statefulset spec are forbidden".to_string(),
                reason: "Invalid".to_string(),
                code: 422,
            }),
        )
    }

    #[tokio::test]
    async fn test_missing_object_is_created() {
        let mut store = MockStateStore::new();
        store.expect_get_statefulset().returning(|_, _| Ok(None));
        store
            .expect_create_statefulset()
            .times(1)
            .withf(|_, s| s.annotations().contains_key(LAST_APPLIED_ANNOTATION))
            .returning(|_, s| Ok(s.clone()));

        let report = Converger::new(&store, Span::none())
            .converge("default", sts(3))
            .await
            .unwrap();
        assert_eq!(report.outcome, ConvergeOutcome::Created);
    }

    #[tokio::test]
    async fn test_unchanged_object_is_not_updated() {
        let mut store = MockStateStore::new();
        store
            .expect_get_statefulset()
            .returning(|_, _| Ok(Some(stored(sts(3), "7"))));
        store.expect_update_statefulset().never();

        let report = Converger::new(&store, Span::none())
            .converge("default", sts(3))
            .await
            .unwrap();
        assert_eq!(report.outcome, ConvergeOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_drift_is_updated_with_observed_version() {
        let mut store = MockStateStore::new();
        store
            .expect_get_statefulset()
            .returning(|_, _| Ok(Some(stored(sts(3), "7"))));
        store
            .expect_update_statefulset()
            .times(1)
            .withf(|_, s| {
                s.metadata.resource_version.as_deref() == Some("7")
                    && s.spec.as_ref().unwrap().replicas == Some(5)
            })
            .returning(|_, s| Ok(s.clone()));

        let report = Converger::new(&store, Span::none())
            .converge("default", sts(5))
            .await
            .unwrap();
        assert_eq!(report.outcome, ConvergeOutcome::Updated);
    }

    #[tokio::test]
    async fn test_out_of_band_annotations_are_carried_forward() {
        let mut observed = sts(3);
        observed.annotations_mut().insert(
            "deployment.kubernetes.io/revision".to_string(),
            "4".to_string(),
        );
        let observed = stored(observed, "7");

        let mut store = MockStateStore::new();
        store
            .expect_get_statefulset()
            .returning(move |_, _| Ok(Some(observed.clone())));
        store
            .expect_update_statefulset()
            .times(1)
            .withf(|_, s| s.annotations().get("deployment.kubernetes.io/revision").unwrap() == "4")
            .returning(|_, s| Ok(s.clone()));

        Converger::new(&store, Span::none())
            .converge("default", sts(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_update_without_opt_in_is_surfaced() {
        let mut store = MockStateStore::new();
        store
            .expect_get_statefulset()
            .returning(|_, _| Ok(Some(stored(sts(3), "7"))));
        store
            .expect_update_statefulset()
            .returning(|_, _| Err(invalid()));
        store.expect_delete_statefulset().never();

        let err = Converger::new(&store, Span::none())
            .converge("default", sts(5))
            .await
            .unwrap_err();
        assert!(err.is_invalid_structural());
    }

    #[tokio::test]
    async fn test_invalid_update_with_opt_in_recreates() {
        let mut seq = Sequence::new();
        let mut store = MockStateStore::new();
        store
            .expect_get_statefulset()
            .returning(|_, _| Ok(Some(stored(sts(3), "7"))));
        store
            .expect_update_statefulset()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(invalid()));
        store
            .expect_delete_statefulset()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        store
            .expect_create_statefulset()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, s| s.metadata.resource_version.is_none())
            .returning(|_, s| Ok(s.clone()));

        let report = Converger::new(&store, Span::none())
            .allow_recreate(true)
            .converge("default", sts(5))
            .await
            .unwrap();
        assert_eq!(report.outcome, ConvergeOutcome::Recreated);
    }

    #[tokio::test]
    async fn test_conflict_is_surfaced_unmodified() {
        let mut store = MockStateStore::new();
        store
            .expect_get_statefulset()
            .returning(|_, _| Ok(Some(stored(sts(3), "7"))));
        store.expect_update_statefulset().returning(|_, _| {
            Err(Error::Conflict {
                kind: "StatefulSet".to_string(),
                name: "cache".to_string(),
                message: "the object has been modified".to_string(),
            })
        });

        let err = Converger::new(&store, Span::none())
            .allow_recreate(true)
            .converge("default", sts(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[test]
    fn test_carry_forward_keeps_desired_values() {
        let mut observed = sts(3);
        observed.metadata.annotations = Some(BTreeMap::from([
            (CAPACITY_ANNOTATION.to_string(), "1".to_string()),
            ("team".to_string(), "old".to_string()),
            (LAST_APPLIED_ANNOTATION.to_string(), "{}".to_string()),
        ]));
        let mut desired = sts(3);
        desired
            .annotations_mut()
            .insert("team".to_string(), "new".to_string());

        carry_forward_annotations(&observed, &mut desired);
        let annotations = desired.annotations();
        assert_eq!(annotations.get("team").unwrap(), "new");
        assert_eq!(annotations.get(CAPACITY_ANNOTATION).unwrap(), "1");
        assert!(!annotations.contains_key(LAST_APPLIED_ANNOTATION));
    }
}
