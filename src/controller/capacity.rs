//! Volume claim capacity coordination.
//!
//! Claim templates of a StatefulSet are immutable, but the claims created
//! from them can grow in place. When the requested storage of the data
//! template moves past the recorded watermark, every claim of the workload
//! is resized individually. The watermark only advances once all of them
//! are confirmed, so a partially failed batch is retried on the next pass.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tracing::{Instrument, Span, info, warn};

use crate::controller::error::Result;
use crate::controller::store::StateStore;
use crate::resources::common::{claim_capacity_bytes, claim_selector_labels, storage_request_bytes};

/// Annotation on the StatefulSet recording the last confirmed capacity in bytes.
pub const CAPACITY_ANNOTATION: &str = "storageCapacity";

/// Recorded capacity watermark; 0 when absent or unparsable.
pub fn watermark(sts: &StatefulSet) -> i64 {
    sts.annotations()
        .get(CAPACITY_ANNOTATION)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

pub fn set_watermark(sts: &mut StatefulSet, bytes: i64) {
    sts.annotations_mut()
        .insert(CAPACITY_ANNOTATION.to_string(), bytes.to_string());
}

/// Result of one capacity pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapacityOutcome {
    /// Claims matched by the workload's selector.
    pub claims: usize,
    /// Claims whose request was updated.
    pub resized: usize,
    /// Claims whose update failed.
    pub failed: usize,
}

impl CapacityOutcome {
    /// Whether the watermark may advance to the desired capacity.
    pub fn confirmed(&self) -> bool {
        self.failed == 0 && self.claims > 0
    }
}

/// Resizes the volume claims of one workload.
pub struct CapacityCoordinator<'a> {
    store: &'a dyn StateStore,
    span: Span,
}

impl<'a> CapacityCoordinator<'a> {
    pub fn new(store: &'a dyn StateStore, span: Span) -> Self {
        Self { store, span }
    }

    /// Bring every data claim of `workload` up to the capacity requested
    /// by `template`.
    ///
    /// Failed claim updates are logged and counted, never returned: the
    /// whole batch is retried on the next pass. Only the listing itself
    /// can fail the call.
    pub async fn reconcile_capacity(
        &self,
        namespace: &str,
        workload: &str,
        template: &PersistentVolumeClaim,
        current_watermark: i64,
    ) -> Result<CapacityOutcome> {
        async {
            let Some(desired) = storage_request_bytes(template) else {
                return Ok(CapacityOutcome::default());
            };

            let prefix = format!("{}-{}-", template.name_any(), workload);
            let claims: Vec<PersistentVolumeClaim> = self
                .store
                .list_claims(namespace, &claim_selector_labels(workload))
                .await?
                .into_iter()
                .filter(|c| c.name_any().starts_with(&prefix))
                .collect();

            let mut outcome = CapacityOutcome {
                claims: claims.len(),
                ..Default::default()
            };

            for mut claim in claims {
                let current = claim_capacity_bytes(&claim).unwrap_or(0);
                if current >= desired {
                    continue;
                }

                let requests = template
                    .spec
                    .as_ref()
                    .and_then(|s| s.resources.as_ref())
                    .and_then(|r| r.requests.clone());
                claim
                    .spec
                    .get_or_insert_with(Default::default)
                    .resources
                    .get_or_insert_with(Default::default)
                    .requests = requests;

                match self.store.update_claim(namespace, &claim).await {
                    Ok(_) => {
                        outcome.resized += 1;
                        info!(claim = %claim.name_any(), from = current, to = desired, "resize pvc");
                    }
                    Err(e) => {
                        outcome.failed += 1;
                        warn!(claim = %claim.name_any(), error = %e, "failed to resize pvc");
                    }
                }
            }

            if outcome.confirmed() {
                if outcome.resized > 0 {
                    info!(from = current_watermark, to = desired, "resize statefulset pvc");
                } else {
                    info!(to = desired, "resize nothing, just set annotations");
                }
            }

            Ok(outcome)
        }
        .instrument(self.span.clone())
        .await
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
    use crate::controller::error::Error;
    use crate::controller::store::MockStateStore;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn claim(name: &str, size: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
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

    const GI: i64 = 1 << 30;

    #[test]
    fn test_watermark_roundtrip() {
        let mut sts = StatefulSet::default();
        assert_eq!(watermark(&sts), 0);
        set_watermark(&mut sts, 5 * GI);
        assert_eq!(watermark(&sts), 5 * GI);

        sts.annotations_mut()
            .insert(CAPACITY_ANNOTATION.to_string(), "garbage".to_string());
        assert_eq!(watermark(&sts), 0);
    }

    #[tokio::test]
    async fn test_resizes_only_smaller_data_claims() {
        let mut store = MockStateStore::new();
        store
            .expect_list_claims()
            .withf(|ns, selector| ns == "default" && selector.get("app").unwrap() == "cache")
            .returning(|_, _| {
                Ok(vec![
                    claim("cache-cache-0", "1Gi"),
                    claim("cache-cache-1", "2Gi"),
                    claim("node-conf-cache-0", "1Gi"),
                ])
            });
        store
            .expect_update_claim()
            .times(1)
            .withf(|_, c| {
                c.name_any() == "cache-cache-0" && storage_request_bytes(c) == Some(2 * GI)
            })
            .returning(|_, c| Ok(c.clone()));

        let coordinator = CapacityCoordinator::new(&store, Span::none());
        let outcome = coordinator
            .reconcile_capacity("default", "cache", &claim("cache", "2Gi"), GI)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CapacityOutcome {
                claims: 2,
                resized: 1,
                failed: 0
            }
        );
        assert!(outcome.confirmed());
    }

    #[tokio::test]
    async fn test_partial_failure_is_not_confirmed() {
        let mut store = MockStateStore::new();
        store.expect_list_claims().returning(|_, _| {
            Ok(vec![claim("cache-cache-0", "1Gi"), claim("cache-cache-1", "1Gi")])
        });
        store.expect_update_claim().times(2).returning(|_, c| {
            if c.name_any() == "cache-cache-1" {
                Err(Error::Transient("quota exceeded".to_string()))
            } else {
                Ok(c.clone())
            }
        });

        let coordinator = CapacityCoordinator::new(&store, Span::none());
        let outcome = coordinator
            .reconcile_capacity("default", "cache", &claim("cache", "2Gi"), GI)
            .await
            .unwrap();
        assert_eq!(outcome.resized, 1);
        assert_eq!(outcome.failed, 1);
        assert!(!outcome.confirmed());
    }

    #[tokio::test]
    async fn test_no_claims_is_not_confirmed() {
        let mut store = MockStateStore::new();
        store.expect_list_claims().returning(|_, _| Ok(vec![]));
        store.expect_update_claim().never();

        let coordinator = CapacityCoordinator::new(&store, Span::none());
        let outcome = coordinator
            .reconcile_capacity("default", "cache", &claim("cache", "2Gi"), 0)
            .await
            .unwrap();
        assert!(!outcome.confirmed());
    }

    #[tokio::test]
    async fn test_list_failure_is_surfaced() {
        let mut store = MockStateStore::new();
        store
            .expect_list_claims()
            .returning(|_, _| Err(Error::Transient("apiserver unavailable".to_string())));

        let coordinator = CapacityCoordinator::new(&store, Span::none());
        assert!(
            coordinator
                .reconcile_capacity("default", "cache", &claim("cache", "2Gi"), 0)
                .await
                .is_err()
        );
    }
}
