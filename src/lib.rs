//! redis-sentinel-operator library crate
//!
//! This module exports the controllers, CRD definitions, and resource generators.

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use config::OperatorConfig;
pub use health::HealthState;

use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, metadata_watcher, predicates, reflector, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::context::Context;
use controller::error::Error;
use controller::{replication_reconciler, sentinel_reconciler};
use crd::{RedisReplication, RedisSentinel};

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Default watcher configuration shared by both controllers.
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create a reflector-backed stream that skips status-only updates.
///
/// Returns the reflector store (for cache lookups) and the filtered stream.
fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

/// Log the outcome of one reconcile, demoting "object gone" to debug.
fn log_result<K>(
    kind: &'static str,
    result: Result<(ObjectRef<K>, Action), kube::runtime::controller::Error<Error, watcher::Error>>,
) where
    K: Resource,
{
    match result {
        Ok((obj, _action)) => {
            debug!(kind, "Reconciled: {}", obj.name);
        }
        Err(e) => {
            let is_not_found = match &e {
                kube::runtime::controller::Error::ObjectNotFound(_) => true,
                kube::runtime::controller::Error::ReconcilerFailed(err, _) => err.is_not_found(),
                _ => false,
            };
            if is_not_found {
                debug!(kind, "Object no longer exists (likely deleted): {:?}", e);
            } else {
                error!(kind, "Reconciliation error: {:?}", e);
            }
        }
    }
}

/// Run the RedisReplication controller.
pub async fn run_replication_controller(ctx: Arc<Context>) {
    let namespace = ctx.config.watch_namespace.clone();
    let client = ctx.client.clone();
    let watcher_config = default_watcher_config();

    let replications: Api<RedisReplication> = scoped_api(client.clone(), namespace.as_deref());
    let statefulsets: Api<StatefulSet> = scoped_api(client.clone(), namespace.as_deref());
    let services: Api<Service> = scoped_api(client, namespace.as_deref());

    let (reader, stream) = create_filtered_stream(replications, watcher_config.clone());

    // StatefulSets are watched in full because readyReplicas feeds status;
    // services only need metadata.
    Controller::for_stream(stream, reader)
        .owns(statefulsets, watcher_config.clone())
        .owns_stream(metadata_watcher(services, watcher_config).touched_objects())
        .run(
            replication_reconciler::reconcile,
            replication_reconciler::error_policy,
            ctx,
        )
        .for_each(|result| async move { log_result(replication_reconciler::KIND, result) })
        .await;

    error!("RedisReplication controller stream ended unexpectedly");
}

/// Run the RedisSentinel controller.
pub async fn run_sentinel_controller(ctx: Arc<Context>) {
    let namespace = ctx.config.watch_namespace.clone();
    let client = ctx.client.clone();
    let watcher_config = default_watcher_config();

    let sentinels: Api<RedisSentinel> = scoped_api(client.clone(), namespace.as_deref());
    let statefulsets: Api<StatefulSet> = scoped_api(client.clone(), namespace.as_deref());
    let services: Api<Service> = scoped_api(client.clone(), namespace.as_deref());
    let pdbs: Api<PodDisruptionBudget> = scoped_api(client, namespace.as_deref());

    let (reader, stream) = create_filtered_stream(sentinels, watcher_config.clone());

    Controller::for_stream(stream, reader)
        .owns(statefulsets, watcher_config.clone())
        .owns_stream(metadata_watcher(services, watcher_config.clone()).touched_objects())
        .owns_stream(metadata_watcher(pdbs, watcher_config).touched_objects())
        .run(
            sentinel_reconciler::reconcile,
            sentinel_reconciler::error_policy,
            ctx,
        )
        .for_each(|result| async move { log_result(sentinel_reconciler::KIND, result) })
        .await;

    error!("RedisSentinel controller stream ended unexpectedly");
}

/// Run both controllers until either stream ends.
///
/// If health_state is provided, it is marked ready and metrics are recorded
/// for reconciliations.
pub async fn run_controllers(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    info!(
        scope = config.watch_namespace.as_deref().unwrap_or("cluster-wide"),
        "Starting RedisReplication and RedisSentinel controllers"
    );

    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let ctx = Arc::new(Context::new(client, config, health_state));

    tokio::select! {
        _ = run_replication_controller(ctx.clone()) => {}
        _ = run_sentinel_controller(ctx) => {}
    }
}
