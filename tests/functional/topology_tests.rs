//! Master resolution end to end: replication lookup, credentials, pod
//! addresses and probing, through to the sentinel workload that consumes
//! the result.

use k8s_openapi::api::apps::v1::StatefulSet;
use redis_sentinel_operator::client::ReplicaStatus;
use redis_sentinel_operator::controller::converger::{ConvergeOutcome, Converger};
use redis_sentinel_operator::controller::error::Error;
use redis_sentinel_operator::controller::topology::MasterResolver;
use redis_sentinel_operator::resources::common::sentinel_workload_name;
use redis_sentinel_operator::resources::compile_sentinel;
use tracing::Span;

use crate::fixtures::{ReplicationBuilder, SentinelBuilder};
use crate::mock_store::{MemoryStore, TableProber};

const NS: &str = "default";

/// A three-replica `cache` with pods at 10.0.0.10..12.
fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.insert_replication(ReplicationBuilder::new("cache").cluster_size(3).build());
    for ordinal in 0..3 {
        store.set_pod_ip(NS, &format!("cache-{}", ordinal), &format!("10.0.0.{}", 10 + ordinal));
    }
    store
}

fn env_value(sts: &StatefulSet, name: &str) -> Option<String> {
    sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
        .env
        .as_ref()
        .unwrap()
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.clone())
}

#[tokio::test]
async fn test_resolves_master_by_reference() {
    let store = seeded_store();
    let prober = TableProber::new(&[
        ("10.0.0.10", ReplicaStatus::replica()),
        ("10.0.0.11", ReplicaStatus::master(2)),
        ("10.0.0.12", ReplicaStatus::replica()),
    ]);

    let address = MasterResolver::new(&store, &prober, Span::none())
        .resolve_reference(NS, "cache")
        .await
        .unwrap();

    assert_eq!(address.as_deref(), Some("10.0.0.11"));
    assert_eq!(prober.probed(), vec!["10.0.0.10", "10.0.0.11", "10.0.0.12"]);
}

#[tokio::test]
async fn test_missing_replication_resolves_to_none() {
    let store = MemoryStore::new();
    let prober = TableProber::default();

    let address = MasterResolver::new(&store, &prober, Span::none())
        .resolve_reference(NS, "absent")
        .await
        .unwrap();

    assert!(address.is_none());
    assert!(prober.probed().is_empty());
}

#[tokio::test]
async fn test_malformed_replication_resolves_to_none() {
    let store = seeded_store();
    store.corrupt_replication(NS, "cache");
    let prober = TableProber::new(&[("10.0.0.10", ReplicaStatus::master(2))]);

    let address = MasterResolver::new(&store, &prober, Span::none())
        .resolve_reference(NS, "cache")
        .await
        .unwrap();

    assert!(address.is_none());
    assert!(prober.probed().is_empty());
}

#[tokio::test]
async fn test_missing_password_secret_fails_resolution() {
    let store = MemoryStore::new();
    store.insert_replication(
        ReplicationBuilder::new("cache")
            .password_secret("redis-auth", "password")
            .build(),
    );
    store.set_pod_ip(NS, "cache-0", "10.0.0.10");
    let prober = TableProber::new(&[("10.0.0.10", ReplicaStatus::master(2))]);
    let resolver = MasterResolver::new(&store, &prober, Span::none());

    let err = resolver.resolve_reference(NS, "cache").await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "unexpected error: {err}");
    assert!(prober.probed().is_empty());

    store.insert_secret(NS, "redis-auth", &[("password", "s3cret")]);
    let address = resolver.resolve_reference(NS, "cache").await.unwrap();
    assert_eq!(address.as_deref(), Some("10.0.0.10"));
}

#[tokio::test]
async fn test_ipv6_master_is_bracketed() {
    let store = MemoryStore::new();
    store.insert_replication(ReplicationBuilder::new("cache").cluster_size(2).build());
    store.set_pod_ip(NS, "cache-0", "fd00::a");
    store.set_pod_ip(NS, "cache-1", "fd00::b");
    let prober = TableProber::new(&[
        ("fd00::a", ReplicaStatus::replica()),
        ("fd00::b", ReplicaStatus::master(1)),
    ]);

    let address = MasterResolver::new(&store, &prober, Span::none())
        .resolve_reference(NS, "cache")
        .await
        .unwrap();

    assert_eq!(address.as_deref(), Some("[fd00::b]"));
}

#[tokio::test]
async fn test_pods_without_ip_are_unknown() {
    let store = MemoryStore::new();
    store.insert_replication(ReplicationBuilder::new("cache").cluster_size(3).build());
    store.set_pod_ip(NS, "cache-2", "10.0.0.12");
    let prober = TableProber::new(&[("10.0.0.12", ReplicaStatus::master(0))]);

    let resolver = MasterResolver::new(&store, &prober, Span::none());
    let address = resolver.resolve_reference(NS, "cache").await.unwrap();

    // Pending pods are skipped, not fatal.
    assert_eq!(address.as_deref(), Some("10.0.0.12"));
    assert_eq!(prober.probed(), vec!["10.0.0.12"]);
}

#[tokio::test]
async fn test_split_brain_picks_master_with_replicas() {
    let store = seeded_store();
    let prober = TableProber::new(&[
        ("10.0.0.10", ReplicaStatus::master(0)),
        ("10.0.0.11", ReplicaStatus::replica()),
        ("10.0.0.12", ReplicaStatus::master(1)),
    ]);
    let resolver = MasterResolver::new(&store, &prober, Span::none());

    let replication = ReplicationBuilder::new("cache").cluster_size(3).build();
    let location = resolver.locate(&replication).await.unwrap().unwrap();
    assert_eq!(location.pod, "cache-2");
    assert_eq!(location.address, "10.0.0.12");

    // Isolated masters on both sides are reported as no master at all.
    prober.set("10.0.0.12", ReplicaStatus::master(0));
    assert!(resolver.locate(&replication).await.unwrap().is_none());
}

#[tokio::test]
async fn test_all_replicas_unreachable_resolves_to_none() {
    let store = seeded_store();
    let prober = TableProber::default();

    let address = MasterResolver::new(&store, &prober, Span::none())
        .resolve_reference(NS, "cache")
        .await
        .unwrap();

    assert!(address.is_none());
    assert_eq!(prober.probed().len(), 3);
}

#[tokio::test]
async fn test_failover_rolls_sentinel_workload() {
    let store = seeded_store();
    let prober = TableProber::new(&[
        ("10.0.0.10", ReplicaStatus::master(2)),
        ("10.0.0.11", ReplicaStatus::replica()),
        ("10.0.0.12", ReplicaStatus::replica()),
    ]);
    let sentinel = SentinelBuilder::new("rs").monitors("cache").build();
    let workload = sentinel_workload_name("rs");
    let resolver = MasterResolver::new(&store, &prober, Span::none());
    let converger = Converger::new(&store, Span::none());

    let master = resolver.resolve_reference(NS, "cache").await.unwrap();
    let report = converger
        .converge(NS, compile_sentinel(&sentinel, master.as_deref()))
        .await
        .unwrap();
    assert_eq!(report.outcome, ConvergeOutcome::Created);
    let sts = store.statefulset(NS, &workload).unwrap();
    assert_eq!(env_value(&sts, "IP").as_deref(), Some("10.0.0.10"));

    // Same topology: nothing to do.
    let master = resolver.resolve_reference(NS, "cache").await.unwrap();
    let report = converger
        .converge(NS, compile_sentinel(&sentinel, master.as_deref()))
        .await
        .unwrap();
    assert_eq!(report.outcome, ConvergeOutcome::Unchanged);

    // Promote cache-1.
    prober.set("10.0.0.10", ReplicaStatus::replica());
    prober.set("10.0.0.11", ReplicaStatus::master(2));
    let master = resolver.resolve_reference(NS, "cache").await.unwrap();
    assert_eq!(master.as_deref(), Some("10.0.0.11"));
    let report = converger
        .converge(NS, compile_sentinel(&sentinel, master.as_deref()))
        .await
        .unwrap();
    assert_eq!(report.outcome, ConvergeOutcome::Updated);
    let sts = store.statefulset(NS, &workload).unwrap();
    assert_eq!(env_value(&sts, "IP").as_deref(), Some("10.0.0.11"));
}

#[tokio::test]
async fn test_sentinels_start_without_master() {
    let store = MemoryStore::new();
    let prober = TableProber::default();
    let sentinel = SentinelBuilder::new("rs").monitors("absent").build();

    let master = MasterResolver::new(&store, &prober, Span::none())
        .resolve_reference(NS, "absent")
        .await
        .unwrap();
    Converger::new(&store, Span::none())
        .converge(NS, compile_sentinel(&sentinel, master.as_deref()))
        .await
        .unwrap();

    let sts = store.statefulset(NS, &sentinel_workload_name("rs")).unwrap();
    assert_eq!(env_value(&sts, "IP"), None);
    assert_eq!(env_value(&sts, "MASTER_GROUP_NAME").as_deref(), Some("redisSentinelCluster"));
}
