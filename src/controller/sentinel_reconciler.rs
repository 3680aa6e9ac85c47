//! Reconciliation loop for RedisSentinel.
//!
//! The master of the referenced RedisReplication is resolved first; its
//! address is baked into the sentinel workload's environment, so a master
//! change rolls the sentinels on the next pass.

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::DeleteParams;
use kube::{Api, ResourceExt, runtime::controller::Action};
use tracing::{debug, error, info, info_span, warn};

use crate::controller::common::{apply, patch_status};
use crate::controller::context::Context;
use crate::controller::converger::{ConvergeOutcome, Converger};
use crate::controller::error::Error;
use crate::controller::store::StateStore;
use crate::controller::topology::MasterResolver;
use crate::crd::{Condition, RedisSentinel, RedisSentinelStatus, upsert_condition};
use crate::resources::common::{recreate_requested, sentinel_workload_name};
use crate::resources::pdb::generate_pod_disruption_budget;
use crate::resources::sentinel::{compile_sentinel, sentinel_params};
use crate::resources::services::generate_services;

pub const KIND: &str = "RedisSentinel";

/// Reconcile a RedisSentinel
pub async fn reconcile(obj: Arc<RedisSentinel>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let span = info_span!("reconcile", kind = KIND, namespace = %namespace, name = %name);

    debug!(parent: &span, "Reconciling RedisSentinel");

    if obj.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let replication = &obj.spec.redis_sentinel_config.redis_replication_name;
    let resolver = MasterResolver::new(&ctx.store, &ctx.prober, span.clone())
        .with_probe_budget(ctx.config.probe_timeout);
    let master_address = resolver
        .resolve_reference(&namespace, replication)
        .await
        .inspect_err(|e| error!(parent: &span, replication = %replication, error = %e, "Failed to resolve master"))?;

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_master_resolution(&namespace, replication, master_address.is_some());
    }
    if master_address.is_none() {
        warn!(parent: &span, replication = %replication, "No master found, sentinels will start without one");
    }

    let report = Converger::new(&ctx.store, span.clone())
        .allow_recreate(recreate_requested(obj.as_ref()))
        .converge(&namespace, compile_sentinel(&obj, master_address.as_deref()))
        .await
        .inspect_err(|e| error!(parent: &span, error = %e, "Failed to converge statefulset"))?;

    let workload = sentinel_workload_name(&name);
    match report.outcome {
        ConvergeOutcome::Created => {
            ctx.publish_normal_event(
                obj.as_ref(),
                "StatefulSetCreated",
                "Converge",
                Some(format!("Created StatefulSet {}", workload)),
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
                    workload
                )),
            )
            .await;
        }
        ConvergeOutcome::Updated | ConvergeOutcome::Unchanged => {}
    }

    let params = sentinel_params(&obj, master_address.as_deref());
    let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    for service in generate_services(&params, obj.spec.kubernetes_config.service.as_ref()) {
        apply(&svc_api, &service).await?;
    }

    let pdb_api: Api<PodDisruptionBudget> = Api::namespaced(ctx.client.clone(), &namespace);
    match generate_pod_disruption_budget(&params, obj.spec.pod_disruption_budget.as_ref()) {
        Some(pdb) => apply(&pdb_api, &pdb).await?,
        None => delete_stale_pdb(&pdb_api, &workload).await?,
    }

    let ready_replicas = ctx
        .store
        .get_statefulset(&namespace, &workload)
        .await?
        .and_then(|sts| sts.status)
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.set_resource_replicas(
            KIND,
            &namespace,
            &name,
            i64::from(obj.spec.size),
            i64::from(ready_replicas),
        );
    }

    let previous = obj.status.as_ref().and_then(|s| s.master_address.clone());
    if let Some(ref address) = master_address
        && previous.as_ref() != Some(address)
    {
        info!(parent: &span, master = %address, "Monitored master changed");
        ctx.publish_normal_event(
            obj.as_ref(),
            "MasterAddressChanged",
            "Discover",
            Some(format!("Sentinels now monitor {}", address)),
        )
        .await;
    }

    let api: Api<RedisSentinel> = Api::namespaced(ctx.client.clone(), &namespace);
    let status = build_status(&obj, ready_replicas, master_address);
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
pub fn error_policy(obj: Arc<RedisSentinel>, error: &Error, ctx: Arc<Context>) -> Action {
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

async fn delete_stale_pdb(api: &Api<PodDisruptionBudget>, name: &str) -> Result<(), Error> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            info!(pdb = %name, "deleted disabled pod disruption budget");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Status for the current pass.
pub fn build_status(
    obj: &RedisSentinel,
    ready_replicas: i32,
    master_address: Option<String>,
) -> RedisSentinelStatus {
    let generation = obj.metadata.generation;
    let desired = obj.spec.size;
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
            if ready { "AllSentinelsReady" } else { "SentinelsNotReady" },
            &format!("{}/{} sentinels ready", ready_replicas, desired),
            generation,
        ),
    );
    let replication = &obj.spec.redis_sentinel_config.redis_replication_name;
    upsert_condition(
        &mut conditions,
        match &master_address {
            Some(address) => Condition::master_resolved(
                true,
                "MasterFound",
                &format!("Monitoring {} of {}", address, replication),
                generation,
            ),
            None => Condition::master_resolved(
                false,
                "NoMaster",
                &format!("No usable master in {}", replication),
                generation,
            ),
        },
    );

    RedisSentinelStatus {
        observed_generation: generation,
        ready_replicas,
        master_address,
        conditions,
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
    use crate::crd::{RedisSentinelConfig, RedisSentinelSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sentinel(size: i32) -> RedisSentinel {
        RedisSentinel {
            metadata: ObjectMeta {
                name: Some("cache".to_string()),
                namespace: Some("default".to_string()),
                generation: Some(2),
                ..Default::default()
            },
            spec: RedisSentinelSpec {
                size,
                redis_sentinel_config: RedisSentinelConfig {
                    redis_replication_name: "cache-replication".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn test_status_with_master() {
        let status = build_status(&sentinel(3), 3, Some("10.0.0.7".to_string()));

        assert_eq!(status.observed_generation, Some(2));
        assert_eq!(status.master_address.as_deref(), Some("10.0.0.7"));
        let resolved = status
            .conditions
            .iter()
            .find(|c| c.r#type == "MasterResolved")
            .unwrap();
        assert_eq!(resolved.status, "True");
        assert_eq!(resolved.message, "Monitoring 10.0.0.7 of cache-replication");
    }

    #[test]
    fn test_status_without_master() {
        let status = build_status(&sentinel(3), 2, None);

        assert!(status.master_address.is_none());
        let ready = status.conditions.iter().find(|c| c.r#type == "Ready").unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, "SentinelsNotReady");
    }
}
