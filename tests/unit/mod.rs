//! Unit tests for redis-sentinel-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation.

mod crd_tests {
    use redis_sentinel_operator::crd::{
        Condition, RedisReplicationSpec, RedisSentinelConfig, RedisSentinelSpec, upsert_condition,
    };

    #[test]
    fn test_condition_ready() {
        let condition = Condition::ready(true, "AllReplicasReady", "3/3 replicas ready", Some(1));
        assert_eq!(condition.r#type, "Ready");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, "AllReplicasReady");
        assert_eq!(condition.message, "3/3 replicas ready");
        assert_eq!(condition.observed_generation, Some(1));
    }

    #[test]
    fn test_condition_master_resolved() {
        let condition = Condition::master_resolved(false, "NoMaster", "none", None);
        assert_eq!(condition.r#type, "MasterResolved");
        assert_eq!(condition.status, "False");
    }

    #[test]
    fn test_upsert_keeps_transition_time_when_status_is_unchanged() {
        let mut old = Condition::ready(true, "AllReplicasReady", "3/3", Some(1));
        old.last_transition_time = "2024-01-01T00:00:00Z".to_string();
        let mut conditions = vec![old];

        upsert_condition(
            &mut conditions,
            Condition::ready(true, "AllReplicasReady", "3/3", Some(2)),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].observed_generation, Some(2));

        upsert_condition(
            &mut conditions,
            Condition::ready(false, "ReplicasNotReady", "2/3", Some(3)),
        );
        assert_ne!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].reason, "ReplicasNotReady");
    }

    #[test]
    fn test_upsert_appends_new_type() {
        let mut conditions = vec![Condition::ready(true, "AllReplicasReady", "", None)];
        upsert_condition(
            &mut conditions,
            Condition::master_resolved(true, "MasterFound", "", None),
        );
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn test_sentinel_config_defaults() {
        let config = RedisSentinelConfig::default();
        assert_eq!(config.redis_replication_name, "redis-sentinel");
        assert_eq!(config.master_group_name, "redisSentinelCluster");
        assert_eq!(config.quorum, "2");
    }

    #[test]
    fn test_sentinel_spec_deserializes_with_defaults() {
        let spec: RedisSentinelSpec = serde_json::from_value(serde_json::json!({
            "kubernetesConfig": {"image": "quay.io/opstree/redis-sentinel:v7.0.12"},
            "redisSentinelConfig": {"redisReplicationName": "cache"}
        }))
        .unwrap();
        assert_eq!(spec.size, 3);
        assert_eq!(spec.redis_sentinel_config.redis_replication_name, "cache");
        assert_eq!(spec.redis_sentinel_config.redis_port, "26379");
    }

    #[test]
    fn test_replication_spec_defaults_cluster_size() {
        let spec: RedisReplicationSpec = serde_json::from_value(serde_json::json!({
            "kubernetesConfig": {"image": "quay.io/opstree/redis:v7.0.12"}
        }))
        .unwrap();
        assert_eq!(spec.cluster_size, 3);
        assert!(spec.storage.is_none());
    }

    #[test]
    fn test_replication_spec_requires_kubernetes_config() {
        let result: Result<RedisReplicationSpec, _> =
            serde_json::from_value(serde_json::json!({"clusterSize": 3}));
        assert!(result.is_err());
    }
}

mod config_tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use redis_sentinel_operator::OperatorConfig;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = OperatorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_overrides() {
        let config = OperatorConfig::from_lookup(lookup(&[
            ("WATCH_NAMESPACE", "redis"),
            ("PROBE_TIMEOUT_SECS", "2"),
            ("HEALTH_PORT", "9090"),
        ]))
        .unwrap();
        assert_eq!(config.watch_namespace.as_deref(), Some("redis"));
        assert_eq!(config.probe_timeout, Duration::from_secs(2));
        assert_eq!(config.health_port, 9090);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        assert!(OperatorConfig::from_lookup(lookup(&[("PROBE_TIMEOUT_SECS", "0")])).is_err());
        assert!(OperatorConfig::from_lookup(lookup(&[("HEALTH_PORT", "70000")])).is_err());
    }
}

mod error_tests {
    use std::time::Duration;

    use redis_sentinel_operator::controller::error::Error;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Transient("connection reset".into()).is_retryable());
        assert!(Error::Configuration("secret redis-auth not found".into()).is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(
            !Error::InvalidStructural {
                kind: "StatefulSet".into(),
                name: "cache".into(),
                message: "Forbidden".into(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_conflict_requeues_quickly() {
        let conflict = Error::Conflict {
            kind: "StatefulSet".into(),
            name: "cache".into(),
            message: "modified".into(),
        };
        assert!(conflict.is_retryable());
        assert_eq!(conflict.requeue_after(), Duration::from_secs(1));
        assert_eq!(
            Error::Transient("x".into()).requeue_after(),
            Duration::from_secs(30)
        );
        assert_eq!(
            Error::Validation("x".into()).requeue_after(),
            Duration::from_secs(300)
        );
    }
}

mod naming_tests {
    use redis_sentinel_operator::resources::common::{
        claim_selector_labels, label_selector_string, pod_name, sentinel_workload_name,
    };

    #[test]
    fn test_workload_names() {
        assert_eq!(sentinel_workload_name("rs"), "rs-sentinel");
        assert_eq!(pod_name("cache", 2), "cache-2");
    }

    #[test]
    fn test_claim_selector() {
        let labels = claim_selector_labels("cache");
        assert_eq!(
            label_selector_string(&labels),
            "app=cache,app.kubernetes.io/component=redis,app.kubernetes.io/name=cache"
        );
    }
}

mod parsing_tests {
    use redis_sentinel_operator::client::parsing::ReplicationInfo;
    use redis_sentinel_operator::client::{RedisRole, ReplicaStatus};

    #[test]
    fn test_replica_info_status() {
        let info = "# Replication\r\nrole:slave\r\nmaster_host:10.0.0.1\r\nmaster_link_status:up\r\n";
        let parsed = ReplicationInfo::parse(info).unwrap();
        assert_eq!(parsed.role, RedisRole::Replica);
        assert_eq!(parsed.status(), ReplicaStatus::replica());
    }

    #[test]
    fn test_missing_role_is_an_error() {
        assert!(ReplicationInfo::parse("connected_slaves:1\r\n").is_err());
    }
}
