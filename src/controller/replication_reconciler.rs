//! Reconciliation loop for RedisReplication.
//!
//! One pass compiles the desired StatefulSet, converges the stored object,
//! applies the services, discovers the current master and patches status.
//! Deletion removes the volume claims of the workload before releasing the
//! finalizer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Service;
use kube::{Api, ResourceExt, runtime::controller::Action};
use tracing::{Span, debug, error, info, info_span, warn};

use crate::controller::common::{
    add_finalizer, apply, has_finalizer, patch_status, remove_finalizer,
};
use crate::controller::context::Context;
use crate::controller::converger::{ConvergeOutcome, Converger};
use crate::controller::error::Error;
use crate::controller::store::StateStore;
use crate::controller::topology::{MasterLocation, MasterResolver};
use crate::crd::{Condition, RedisReplication, RedisReplicationStatus, upsert_condition};
use crate::resources::common::{claim_selector_labels, recreate_requested};
use crate::resources::replication::{compile_replication, replication_params};
use crate::resources::services::generate_services;

pub const KIND: &str = "RedisReplication";

/// Reconcile a RedisReplication
pub async fn reconcile(obj: Arc<RedisReplication>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let span = info_span!("reconcile", kind = KIND, namespace = %namespace, name = %name);

    debug!(parent: &span, "Reconciling RedisReplication");

    let api: Api<RedisReplication> = Api::namespaced(ctx.client.clone(), &namespace);

    if obj.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&obj, &ctx, &namespace, &span).await;
    }

    if !has_finalizer(obj.as_ref()) {
        info!(parent: &span, "Adding finalizer");
        add_finalizer(&api, &name).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let report = Converger::new(&ctx.store, span.clone())
        .allow_recreate(recreate_requested(obj.as_ref()))
        .converge(&namespace, compile_replication(&obj))
        .await
        .inspect_err(|e| error!(parent: &span, error = %e, "Failed to converge statefulset"))?;

    match report.outcome {
        ConvergeOutcome::Created => {
            ctx.publish_normal_event(
                obj.as_ref(),
                "StatefulSetCreated",
                "Converge",
                Some(format!("Created StatefulSet {}", name)),
            )
            .await;
        }
        ConvergeOutcome::Recreated => {
            ctx.publish_warning_event(
                obj.as_ref(),
                "StatefulSetRecreated",
                "Converge",
                Some(format!(
                    "StatefulSet {} was deleted and recreated after an invalid update",
                    name
                )),
            )
            .await;
        }
        ConvergeOutcome::Updated | ConvergeOutcome::Unchanged => {}
    }
    if report.resized_claims > 0 {
        ctx.publish_normal_event(
            obj.as_ref(),
            "VolumesResized",
            "Converge",
            Some(format!("Resized {} volume claims", report.resized_claims)),
        )
        .await;
    }

    let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    let params = replication_params(&obj);
    for service in generate_services(&params, obj.spec.kubernetes_config.service.as_ref()) {
        apply(&svc_api, &service).await?;
    }

    let ready_replicas = ready_replicas(&ctx.store, &namespace, &name).await?;

    let resolver = MasterResolver::new(&ctx.store, &ctx.prober, span.clone())
        .with_probe_budget(ctx.config.probe_timeout);
    let master = match resolver.locate(&obj).await {
        Ok(master) => master,
        Err(e) => {
            ctx.publish_warning_event(
                obj.as_ref(),
                "MasterResolutionFailed",
                "Discover",
                Some(e.to_string()),
            )
            .await;
            return Err(e);
        }
    };

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_master_resolution(&namespace, &name, master.is_some());
        health_state
            .metrics
            .record_volume_resizes(&namespace, &name, report.resized_claims);
        health_state.metrics.set_resource_replicas(
            KIND,
            &namespace,
            &name,
            i64::from(obj.spec.cluster_size),
            i64::from(ready_replicas),
        );
    }

    let previous = obj.status.as_ref().and_then(|s| s.master_node.clone());
    let current = master.as_ref().map(|m| m.pod.clone());
    if current.is_some() && previous != current {
        ctx.publish_normal_event(
            obj.as_ref(),
            "MasterChanged",
            "Discover",
            Some(format!(
                "Master is now {}",
                current.as_deref().unwrap_or_default()
            )),
        )
        .await;
    }

    let status = build_status(&obj, ready_replicas, master.as_ref());
    patch_status(&api, &name, &status).await?;

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_reconcile(
            KIND,
            &namespace,
            &name,
            start_time.elapsed().as_secs_f64(),
        );
    }

    Ok(Action::requeue(ctx.config.requeue_interval))
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<RedisReplication>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(KIND, &namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, namespace = %namespace, error = %error, "Retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        error!(name = %name, namespace = %namespace, error = %error, "Non-retryable error");
        Action::requeue(Duration::from_secs(300))
    }
}

/// Status for the current pass.
///
/// Conditions carry over from the previous status; a condition keeps its
/// transition time while its status is unchanged.
pub fn build_status(
    obj: &RedisReplication,
    ready_replicas: i32,
    master: Option<&MasterLocation>,
) -> RedisReplicationStatus {
    let generation = obj.metadata.generation;
    let desired = obj.spec.cluster_size;
    let mut conditions = obj
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    let ready = ready_replicas >= desired;
    upsert_condition(
        &mut conditions,
        Condition::ready(
            ready,
            if ready { "AllReplicasReady" } else { "ReplicasNotReady" },
            &format!("{}/{} replicas ready", ready_replicas, desired),
            generation,
        ),
    );
    upsert_condition(
        &mut conditions,
        match master {
            Some(master) => Condition::master_resolved(
                true,
                "MasterFound",
                &format!("{} at {}", master.pod, master.address),
                generation,
            ),
            None => Condition::master_resolved(
                false,
                "NoMaster",
                "No replica reports a usable master",
                generation,
            ),
        },
    );

    RedisReplicationStatus {
        observed_generation: generation,
        ready_replicas,
        master_node: master.map(|m| m.pod.clone()),
        conditions,
    }
}

/// Ready replicas of the stored workload; 0 when it does not exist yet.
async fn ready_replicas(store: &dyn StateStore, namespace: &str, name: &str) -> Result<i32, Error> {
    Ok(store
        .get_statefulset(namespace, name)
        .await?
        .and_then(|sts| sts.status)
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0))
}

async fn handle_deletion(
    obj: &RedisReplication,
    ctx: &Context,
    namespace: &str,
    span: &Span,
) -> Result<Action, Error> {
    let name = obj.name_any();
    info!(parent: span, "Handling deletion");

    if has_finalizer(obj) {
        if obj.persistence_enabled() {
            delete_claims(&ctx.store, namespace, &name, span).await?;
        }
        let api: Api<RedisReplication> = Api::namespaced(ctx.client.clone(), namespace);
        remove_finalizer(&api, &name).await?;
    }

    Ok(Action::await_change())
}

/// Delete every volume claim labelled as belonging to `workload`.
pub async fn delete_claims(
    store: &dyn StateStore,
    namespace: &str,
    workload: &str,
    span: &Span,
) -> Result<usize, Error> {
    let claims = store
        .list_claims(namespace, &claim_selector_labels(workload))
        .await?;
    for claim in &claims {
        let claim_name = claim.name_any();
        store.delete_claim(namespace, &claim_name).await?;
        info!(parent: span, claim = %claim_name, "deleted pvc");
    }
    Ok(claims.len())
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
    use crate::controller::store::MockStateStore;
    use crate::crd::RedisReplicationSpec;
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn replication(size: i32) -> RedisReplication {
        RedisReplication {
            metadata: ObjectMeta {
                name: Some("cache".to_string()),
                namespace: Some("default".to_string()),
                generation: Some(4),
                ..Default::default()
            },
            spec: RedisReplicationSpec {
                cluster_size: size,
                ..Default::default()
            },
            status: None,
        }
    }

    fn condition<'a>(status: &'a RedisReplicationStatus, kind: &str) -> &'a Condition {
        status.conditions.iter().find(|c| c.r#type == kind).unwrap()
    }

    #[test]
    fn test_status_with_master() {
        let master = MasterLocation {
            pod: "cache-1".to_string(),
            address: "10.0.0.2".to_string(),
        };
        let status = build_status(&replication(3), 3, Some(&master));

        assert_eq!(status.observed_generation, Some(4));
        assert_eq!(status.ready_replicas, 3);
        assert_eq!(status.master_node.as_deref(), Some("cache-1"));
        assert_eq!(condition(&status, "Ready").status, "True");
        assert_eq!(condition(&status, "MasterResolved").reason, "MasterFound");
    }

    #[test]
    fn test_status_without_master() {
        let status = build_status(&replication(3), 1, None);

        assert!(status.master_node.is_none());
        assert_eq!(condition(&status, "Ready").status, "False");
        assert_eq!(condition(&status, "Ready").message, "1/3 replicas ready");
        assert_eq!(condition(&status, "MasterResolved").status, "False");
    }

    #[test]
    fn test_status_keeps_transition_time_when_unchanged() {
        let mut obj = replication(1);
        let mut previous = build_status(&obj, 1, None);
        for c in &mut previous.conditions {
            c.last_transition_time = "2024-01-01T00:00:00Z".to_string();
        }
        obj.status = Some(previous);

        let status = build_status(&obj, 1, None);
        assert_eq!(status.conditions.len(), 2);
        assert!(
            status
                .conditions
                .iter()
                .all(|c| c.last_transition_time == "2024-01-01T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_ready_replicas_of_missing_workload_is_zero() {
        let mut store = MockStateStore::new();
        store.expect_get_statefulset().returning(|_, _| Ok(None));
        assert_eq!(ready_replicas(&store, "default", "cache").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_claims_deletes_every_listed_claim() {
        let mut store = MockStateStore::new();
        store.expect_list_claims().returning(|_, _| {
            Ok(["cache-cache-0", "cache-cache-1", "node-conf-cache-0"]
                .iter()
                .map(|name| PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .collect())
        });
        store
            .expect_delete_claim()
            .times(3)
            .returning(|_, _| Ok(()));

        let deleted = delete_claims(&store, "default", "cache", &Span::none())
            .await
            .unwrap();
        assert_eq!(deleted, 3);
    }
}
