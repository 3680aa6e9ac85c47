// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for redis-sentinel-operator.
//!
//! Uses proptest to generate random inputs and verify invariants.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use proptest::prelude::*;

use redis_sentinel_operator::client::ReplicaStatus;
use redis_sentinel_operator::controller::patch::plan;
use redis_sentinel_operator::controller::topology::{
    PROBE_PHASES, TopologySnapshot, discovery_deadline, format_address, select_master,
};
use redis_sentinel_operator::crd::{RedisReplication, RedisReplicationSpec};
use redis_sentinel_operator::resources::common::{SetupMode, parse_quantity};
use redis_sentinel_operator::resources::compile_replication;
use redis_sentinel_operator::resources::env::{EnvInputs, generate_env_vars};

/// Strategy for generating valid cluster sizes (1-10).
fn valid_cluster_size() -> impl Strategy<Value = i32> {
    1..=10i32
}

/// Strategy for generating one replica's reported status.
fn any_status() -> impl Strategy<Value = ReplicaStatus> {
    prop_oneof![
        Just(ReplicaStatus::unknown()),
        Just(ReplicaStatus::replica()),
        (0u32..4).prop_map(ReplicaStatus::master),
    ]
}

/// Strategy for user labels that do not collide with operator keys.
fn user_labels() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map("team|tier|owner|env", "[a-z]{1,8}", 0..4)
}

fn replication(size: i32, labels: BTreeMap<String, String>) -> RedisReplication {
    RedisReplication {
        metadata: ObjectMeta {
            name: Some("cache".to_string()),
            namespace: Some("default".to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: RedisReplicationSpec {
            cluster_size: size,
            ..Default::default()
        },
        status: None,
    }
}

fn env_names(env: &[EnvVar]) -> Vec<String> {
    env.iter().map(|e| e.name.clone()).collect()
}

proptest! {
    /// The compiled workload always runs exactly clusterSize replicas.
    #[test]
    fn compiled_replicas_match_cluster_size(size in valid_cluster_size(), labels in user_labels()) {
        let sts = compile_replication(&replication(size, labels));
        prop_assert_eq!(sts.spec.unwrap().replicas, Some(size));
    }

    /// Compiling the same resource twice yields an empty plan.
    #[test]
    fn compilation_is_deterministic(size in valid_cluster_size(), labels in user_labels()) {
        let resource = replication(size, labels);
        let first = compile_replication(&resource);
        let second = compile_replication(&resource);
        prop_assert!(plan(&first, &second).unwrap().is_empty());
    }

    /// Extra variables end up sorted by name regardless of input order.
    #[test]
    fn env_is_sorted_independent_of_input_order(
        names in prop::collection::btree_set("[A-Z]{3,10}", 0..8),
        persistence in any::<bool>(),
        acl in any::<bool>(),
    ) {
        let extra: Vec<EnvVar> = names
            .iter()
            .map(|name| EnvVar {
                name: format!("X_{}", name),
                value: Some("1".to_string()),
                ..Default::default()
            })
            .collect();
        let mut reversed = extra.clone();
        reversed.reverse();

        let inputs = |extra: &[EnvVar]| {
            generate_env_vars(&EnvInputs {
                mode: SetupMode::Replication,
                exporter: false,
                password: None,
                persistence,
                tls: None,
                acl,
                extra,
            })
        };
        let forward = inputs(&extra);
        let backward = inputs(&reversed);

        let names = env_names(&forward);
        let mut sorted = names.clone();
        sorted.sort();
        prop_assert_eq!(&names, &sorted);
        prop_assert_eq!(forward, backward);
    }

    /// A selected master always reports the master role; without any
    /// master there is no selection.
    #[test]
    fn selected_master_reports_master(statuses in prop::collection::vec(any_status(), 0..8)) {
        let snapshot: TopologySnapshot = statuses
            .iter()
            .enumerate()
            .map(|(i, s)| (i as i32, *s))
            .collect();
        let masters: Vec<usize> = statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_master())
            .map(|(i, _)| i)
            .collect();

        match select_master(&snapshot) {
            Some(ordinal) => {
                let status = statuses[ordinal as usize];
                prop_assert!(status.is_master());
                if masters.len() > 1 {
                    prop_assert!(status.connected_slaves > 0);
                    // First eligible in discovery order.
                    let first = masters
                        .iter()
                        .find(|i| statuses[**i].connected_slaves > 0)
                        .copied();
                    prop_assert_eq!(first, Some(ordinal as usize));
                }
            }
            None => {
                prop_assert!(
                    masters.is_empty()
                        || (masters.len() > 1
                            && masters.iter().all(|i| statuses[*i].connected_slaves == 0))
                );
            }
        }
    }

    /// A lone master is always selected.
    #[test]
    fn lone_master_is_selected(size in 1usize..8, position in 0usize..8, slaves in 0u32..4) {
        let position = position % size;
        let snapshot: TopologySnapshot = (0..size)
            .map(|i| {
                let status = if i == position {
                    ReplicaStatus::master(slaves)
                } else {
                    ReplicaStatus::replica()
                };
                (i as i32, status)
            })
            .collect();
        prop_assert_eq!(select_master(&snapshot), Some(position as i32));
    }

    /// Binary and decimal suffixes scale exactly.
    #[test]
    fn quantity_suffixes_scale(n in 0i64..4096) {
        prop_assert_eq!(parse_quantity(&Quantity(format!("{}", n))), Some(n));
        prop_assert_eq!(parse_quantity(&Quantity(format!("{}Ki", n))), Some(n << 10));
        prop_assert_eq!(parse_quantity(&Quantity(format!("{}Mi", n))), Some(n << 20));
        prop_assert_eq!(parse_quantity(&Quantity(format!("{}Gi", n))), Some(n << 30));
        prop_assert_eq!(parse_quantity(&Quantity(format!("{}k", n))), Some(n * 1_000));
        prop_assert_eq!(parse_quantity(&Quantity(format!("{}G", n))), Some(n * 1_000_000_000));
    }

    /// Larger quantities never parse to fewer bytes.
    #[test]
    fn quantity_ordering_is_preserved(a in 0i64..1024, b in 0i64..1024) {
        let pa = parse_quantity(&Quantity(format!("{}Mi", a))).unwrap();
        let pb = parse_quantity(&Quantity(format!("{}Mi", b))).unwrap();
        prop_assert_eq!(a.cmp(&b), pa.cmp(&pb));
    }

    /// IPv4 and IPv4-mapped addresses pass through; IPv6 addresses are
    /// bracketed.
    #[test]
    fn address_formatting(octets in any::<[u8; 4]>(), segments in any::<[u16; 8]>()) {
        let v4 = std::net::Ipv4Addr::from(octets);
        prop_assert_eq!(format_address(&v4.to_string()), v4.to_string());
        let mapped = format!("::ffff:{}", v4);
        prop_assert_eq!(format_address(&mapped), mapped.clone());

        let v6 = std::net::Ipv6Addr::from(segments);
        prop_assume!(v6.to_ipv4_mapped().is_none());
        prop_assert_eq!(format_address(&v6.to_string()), format!("[{}]", v6));
    }

    /// The discovery deadline grows with the number of replicas and always
    /// covers every probe phase of every replica.
    #[test]
    fn discovery_deadline_is_monotonic(budget_ms in 1u64..10_000, replicas in 0i32..64) {
        let budget = Duration::from_millis(budget_ms);
        let current = discovery_deadline(budget, replicas);
        prop_assert!(current > budget * PROBE_PHASES * replicas as u32);
        prop_assert!(discovery_deadline(budget, replicas + 1) > current);
    }
}
