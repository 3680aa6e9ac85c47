//! Convergence passes against the in-memory store.
//!
//! Every test drives `Converger` with objects produced by the real compiler,
//! so drift detection sees exactly what a live pass would send.

use k8s_openapi::api::apps::v1::StatefulSet;
use redis_sentinel_operator::controller::capacity::{CAPACITY_ANNOTATION, watermark};
use redis_sentinel_operator::controller::converger::{ConvergeOutcome, Converger};
use redis_sentinel_operator::controller::error::Error;
use redis_sentinel_operator::crd::RedisReplication;
use redis_sentinel_operator::resources::common::{
    claim_selector_labels, pod_name, storage_request_bytes,
};
use redis_sentinel_operator::resources::compile_replication;
use tracing::Span;

use crate::fixtures::{ReplicationBuilder, bound_claim};
use crate::mock_store::{MemoryStore, Write};

const NS: &str = "default";
const GI: i64 = 1 << 30;

async fn converge(store: &MemoryStore, replication: &RedisReplication) -> Result<ConvergeOutcome, Error> {
    Converger::new(store, Span::none())
        .allow_recreate(redis_sentinel_operator::resources::common::recreate_requested(replication))
        .converge(NS, compile_replication(replication))
        .await
        .map(|report| report.outcome)
}

fn stored(store: &MemoryStore) -> StatefulSet {
    store.statefulset(NS, "cache").unwrap()
}

/// Claims for every ordinal, as the StatefulSet controller creates them.
fn seed_claims(store: &MemoryStore, replicas: i32, size: &str) {
    for ordinal in 0..replicas {
        store.insert_claim(
            NS,
            bound_claim(
                &format!("cache-{}", pod_name("cache", ordinal)),
                claim_selector_labels("cache"),
                size,
            ),
        );
    }
}

fn claim_bytes(store: &MemoryStore, name: &str) -> i64 {
    storage_request_bytes(&store.claim(NS, name).unwrap()).unwrap()
}

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let store = MemoryStore::new();
    let replication = ReplicationBuilder::new("cache")
        .storage("1Gi")
        .exporter(true)
        .password_secret("redis-auth", "password")
        .build();

    assert_eq!(converge(&store, &replication).await.unwrap(), ConvergeOutcome::Created);
    let version = store.version();

    assert_eq!(converge(&store, &replication).await.unwrap(), ConvergeOutcome::Unchanged);
    assert_eq!(converge(&store, &replication).await.unwrap(), ConvergeOutcome::Unchanged);
    assert_eq!(store.version(), version);
    assert_eq!(store.writes(), vec![Write::CreateStatefulSet("cache".to_string())]);
}

#[tokio::test]
async fn test_canonicalized_quantities_do_not_count_as_drift() {
    let store = MemoryStore::new();
    let replication = ReplicationBuilder::new("cache")
        .resources("1000m", "1024Mi")
        .build();

    assert_eq!(converge(&store, &replication).await.unwrap(), ConvergeOutcome::Created);
    let container = &stored(&store).spec.unwrap().template.spec.unwrap().containers[0];
    let requests = container.resources.as_ref().unwrap().requests.as_ref().unwrap();
    assert_eq!(requests["cpu"].0, "1");
    assert_eq!(requests["memory"].0, "1Gi");

    assert_eq!(converge(&store, &replication).await.unwrap(), ConvergeOutcome::Unchanged);

    let resized = ReplicationBuilder::new("cache")
        .resources("1500m", "1024Mi")
        .build();
    assert_eq!(converge(&store, &resized).await.unwrap(), ConvergeOutcome::Updated);
    assert_eq!(converge(&store, &resized).await.unwrap(), ConvergeOutcome::Unchanged);
}

#[tokio::test]
async fn test_server_defaults_do_not_count_as_drift() {
    let store = MemoryStore::new();
    let replication = ReplicationBuilder::new("cache").build();
    converge(&store, &replication).await.unwrap();

    let spec = stored(&store).spec.unwrap();
    assert_eq!(spec.revision_history_limit, Some(10));
    assert_eq!(spec.pod_management_policy.as_deref(), Some("OrderedReady"));

    assert_eq!(converge(&store, &replication).await.unwrap(), ConvergeOutcome::Unchanged);
}

#[tokio::test]
async fn test_replica_count_change_is_applied() {
    let store = MemoryStore::new();
    converge(&store, &ReplicationBuilder::new("cache").cluster_size(3).build())
        .await
        .unwrap();

    let resized = ReplicationBuilder::new("cache").cluster_size(5).build();
    assert_eq!(converge(&store, &resized).await.unwrap(), ConvergeOutcome::Updated);
    assert_eq!(stored(&store).spec.unwrap().replicas, Some(5));
    assert_eq!(converge(&store, &resized).await.unwrap(), ConvergeOutcome::Unchanged);
}

#[tokio::test]
async fn test_out_of_band_annotations_survive() {
    let store = MemoryStore::new();
    let replication = ReplicationBuilder::new("cache").build();
    converge(&store, &replication).await.unwrap();

    store.edit_statefulset(NS, "cache", |sts| {
        sts.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert("backup.example.com/schedule".to_string(), "daily".to_string());
    });

    assert_eq!(converge(&store, &replication).await.unwrap(), ConvergeOutcome::Unchanged);
    assert_eq!(
        stored(&store)
            .metadata
            .annotations
            .unwrap()
            .get("backup.example.com/schedule")
            .map(String::as_str),
        Some("daily")
    );
}

#[tokio::test]
async fn test_dropped_label_is_removed() {
    let store = MemoryStore::new();
    converge(&store, &ReplicationBuilder::new("cache").label("team", "storage").build())
        .await
        .unwrap();
    assert!(stored(&store).metadata.labels.unwrap().contains_key("team"));

    let replication = ReplicationBuilder::new("cache").build();
    assert_eq!(converge(&store, &replication).await.unwrap(), ConvergeOutcome::Updated);
    assert!(!stored(&store).metadata.labels.unwrap().contains_key("team"));
    assert_eq!(converge(&store, &replication).await.unwrap(), ConvergeOutcome::Unchanged);
}

#[tokio::test]
async fn test_manual_drift_is_reverted() {
    let store = MemoryStore::new();
    let replication = ReplicationBuilder::new("cache").image("redis:7.0.12").build();
    converge(&store, &replication).await.unwrap();

    store.edit_statefulset(NS, "cache", |sts| {
        let pod = sts.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        pod.containers[0].image = Some("redis:6.2".to_string());
    });

    assert_eq!(converge(&store, &replication).await.unwrap(), ConvergeOutcome::Updated);
    let pod = stored(&store).spec.unwrap().template.spec.unwrap();
    assert_eq!(pod.containers[0].image.as_deref(), Some("redis:7.0.12"));
}

#[tokio::test]
async fn test_invalid_update_without_opt_in_is_surfaced() {
    let store = MemoryStore::new();
    converge(&store, &ReplicationBuilder::new("cache").storage("1Gi").build())
        .await
        .unwrap();
    let original_uid = stored(&store).metadata.uid;
    store.clear_writes();

    // A second claim template changes the template count, which the store
    // rejects as an immutable field change.
    let mut replication = ReplicationBuilder::new("cache").storage("1Gi").build();
    replication.spec.storage.as_mut().unwrap().node_conf_volume = true;

    let err = converge(&store, &replication).await.unwrap_err();
    assert!(err.is_invalid_structural(), "unexpected error: {err}");
    assert!(store.writes().is_empty());
    assert_eq!(stored(&store).metadata.uid, original_uid);
}

#[tokio::test]
async fn test_invalid_update_with_opt_in_recreates() {
    let store = MemoryStore::new();
    converge(&store, &ReplicationBuilder::new("cache").storage("1Gi").build())
        .await
        .unwrap();
    let original_uid = stored(&store).metadata.uid;
    store.clear_writes();

    let mut replication = ReplicationBuilder::new("cache")
        .storage("1Gi")
        .recreate_on_invalid()
        .build();
    replication.spec.storage.as_mut().unwrap().node_conf_volume = true;

    assert_eq!(converge(&store, &replication).await.unwrap(), ConvergeOutcome::Recreated);
    assert_eq!(
        store.writes(),
        vec![
            Write::DeleteStatefulSet("cache".to_string()),
            Write::CreateStatefulSet("cache".to_string()),
        ]
    );

    // The fetched object is the fresh one, at its initial version.
    let recreated = stored(&store);
    assert_ne!(recreated.metadata.uid, original_uid);
    assert_eq!(recreated.metadata.generation, Some(1));
    assert_eq!(
        recreated.metadata.resource_version,
        Some(store.version().to_string())
    );
    let templates = recreated.spec.unwrap().volume_claim_templates.unwrap();
    assert_eq!(templates.len(), 2);

    assert_eq!(converge(&store, &replication).await.unwrap(), ConvergeOutcome::Unchanged);
}

#[tokio::test]
async fn test_rejected_update_with_opt_in_but_valid_shape_recreates() {
    let store = MemoryStore::new();
    let replication = ReplicationBuilder::new("cache").recreate_on_invalid().build();
    converge(&store, &replication).await.unwrap();

    store.reject_updates(true);
    let resized = ReplicationBuilder::new("cache")
        .cluster_size(4)
        .recreate_on_invalid()
        .build();
    assert_eq!(converge(&store, &resized).await.unwrap(), ConvergeOutcome::Recreated);
    assert_eq!(stored(&store).spec.unwrap().replicas, Some(4));
}

#[tokio::test]
async fn test_conflict_is_surfaced_unmodified() {
    let store = MemoryStore::new();
    converge(&store, &ReplicationBuilder::new("cache").build())
        .await
        .unwrap();

    store.conflict_next_update();
    let err = converge(&store, &ReplicationBuilder::new("cache").cluster_size(4).build())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
    assert!(err.is_retryable());

    // The retry on the next pass succeeds.
    assert_eq!(
        converge(&store, &ReplicationBuilder::new("cache").cluster_size(4).build())
            .await
            .unwrap(),
        ConvergeOutcome::Updated
    );
}

#[tokio::test]
async fn test_store_outage_is_surfaced() {
    let store = MemoryStore::new();
    store.set_unavailable(true);
    let err = converge(&store, &ReplicationBuilder::new("cache").build())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transient(_)));
}

#[tokio::test]
async fn test_capacity_growth_resizes_claims_and_advances_watermark() {
    let store = MemoryStore::new();
    converge(&store, &ReplicationBuilder::new("cache").storage("1Gi").build())
        .await
        .unwrap();
    seed_claims(&store, 3, "1Gi");

    // First pass after the claims appear only records the watermark.
    converge(&store, &ReplicationBuilder::new("cache").storage("1Gi").build())
        .await
        .unwrap();
    assert_eq!(watermark(&stored(&store)), GI);

    let grown = ReplicationBuilder::new("cache").storage("2Gi").build();
    assert_eq!(converge(&store, &grown).await.unwrap(), ConvergeOutcome::Updated);

    for ordinal in 0..3 {
        assert_eq!(claim_bytes(&store, &format!("cache-cache-{}", ordinal)), 2 * GI);
    }
    let sts = stored(&store);
    assert_eq!(watermark(&sts), 2 * GI);
    // The template itself is immutable and keeps its original request.
    let template = &sts.spec.unwrap().volume_claim_templates.unwrap()[0];
    assert_eq!(storage_request_bytes(template), Some(GI));

    assert_eq!(converge(&store, &grown).await.unwrap(), ConvergeOutcome::Unchanged);
}

#[tokio::test]
async fn test_partial_resize_failure_holds_watermark_until_retry() {
    let store = MemoryStore::new();
    converge(&store, &ReplicationBuilder::new("cache").storage("1Gi").build())
        .await
        .unwrap();
    seed_claims(&store, 3, "1Gi");

    store.fail_claim_updates("cache-cache-1");
    let grown = ReplicationBuilder::new("cache").storage("2Gi").build();
    converge(&store, &grown).await.unwrap();
    assert_eq!(watermark(&stored(&store)), 0);
    assert_eq!(claim_bytes(&store, "cache-cache-0"), 2 * GI);
    assert_eq!(claim_bytes(&store, "cache-cache-1"), GI);

    store.heal_claim_updates();
    converge(&store, &grown).await.unwrap();
    assert_eq!(watermark(&stored(&store)), 2 * GI);
    assert_eq!(claim_bytes(&store, "cache-cache-1"), 2 * GI);
}

#[tokio::test]
async fn test_watermark_never_decreases() {
    let store = MemoryStore::new();
    converge(&store, &ReplicationBuilder::new("cache").storage("1Gi").build())
        .await
        .unwrap();
    seed_claims(&store, 2, "1Gi");

    let mut last = 0;
    for size in ["2Gi", "1Gi", "4Gi", "3Gi", "4Gi", "512Mi"] {
        converge(&store, &ReplicationBuilder::new("cache").storage(size).build())
            .await
            .unwrap();
        let current = watermark(&stored(&store));
        assert!(current >= last, "watermark dropped from {last} to {current} at {size}");
        last = current;
    }
    assert_eq!(last, 4 * GI);
    assert_eq!(claim_bytes(&store, "cache-cache-0"), 4 * GI);
}

#[tokio::test]
async fn test_no_claims_leaves_watermark_untouched() {
    let store = MemoryStore::new();
    converge(&store, &ReplicationBuilder::new("cache").storage("1Gi").build())
        .await
        .unwrap();

    converge(&store, &ReplicationBuilder::new("cache").storage("2Gi").build())
        .await
        .unwrap();
    let sts = stored(&store);
    assert_eq!(watermark(&sts), 0);
    assert!(
        !sts.metadata
            .annotations
            .unwrap_or_default()
            .contains_key(CAPACITY_ANNOTATION)
    );
}
