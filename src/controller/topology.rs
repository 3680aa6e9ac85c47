//! Live topology discovery for replicated Redis.
//!
//! Each replica of a RedisReplication is probed in ordinal order over a
//! short-lived connection, one at a time. The resulting snapshot is reduced
//! to at most one master with [`select_master`], whose pod IP is then handed
//! to the sentinels.
//!
//! Probe failures classify the replica as unknown and never abort discovery.
//! Only missing credentials fail a resolution outright.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::client::{RedisClient, RedisRole, ReplicaStatus, TlsCertData};
use crate::controller::error::{Error, Result};
use crate::controller::store::{ClusterReader, secret_value};
use crate::crd::RedisReplication;
use crate::resources::common::{REDIS_PORT, pod_name};

/// Credentials for talking to the replicas of one replication.
#[derive(Clone, Default)]
pub struct AuthContext {
    pub password: Option<String>,
    pub tls: Option<TlsCertData>,
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .finish()
    }
}

impl AuthContext {
    /// Load the password and TLS material a replication refers to.
    ///
    /// A referenced secret or key that does not exist is a
    /// [`Error::Configuration`].
    pub async fn for_replication(
        reader: &dyn ClusterReader,
        replication: &RedisReplication,
    ) -> Result<Self> {
        let namespace = replication.namespace().unwrap_or_default();
        let mut auth = AuthContext::default();

        if let Some(secret) = &replication.spec.kubernetes_config.redis_secret {
            let value = secret_value(reader, &namespace, &secret.name, &secret.key).await?;
            let password = String::from_utf8(value).map_err(|_| {
                Error::Configuration(format!(
                    "key {} of secret {}/{} is not valid UTF-8",
                    secret.key, namespace, secret.name
                ))
            })?;
            auth.password = Some(password);
        }

        if let Some(tls) = &replication.spec.tls {
            let name = tls.secret_name().ok_or_else(|| {
                Error::Configuration("TLS is enabled but no secret is referenced".to_string())
            })?;
            auth.tls = Some(TlsCertData {
                ca_cert_pem: secret_value(reader, &namespace, name, tls.ca_key()).await?,
                client_cert_pem: Some(
                    secret_value(reader, &namespace, name, tls.cert_key()).await?,
                ),
                client_key_pem: Some(secret_value(reader, &namespace, name, tls.key()).await?),
            });
        }

        Ok(auth)
    }
}

/// Asks one replica for its role.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReplicaProber: Send + Sync {
    /// Classify the process at `host:port`.
    ///
    /// Never fails: an unreachable or unparsable replica is
    /// [`RedisRole::Unknown`].
    async fn probe(&self, host: &str, port: u16, auth: &AuthContext) -> ReplicaStatus;
}

/// [`ReplicaProber`] over a single-node `fred` connection.
#[derive(Debug, Clone)]
pub struct RedisProber {
    timeout: Duration,
}

impl RedisProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ReplicaProber for RedisProber {
    async fn probe(&self, host: &str, port: u16, auth: &AuthContext) -> ReplicaStatus {
        let client = match RedisClient::connect_single(
            host,
            port,
            auth.password.as_deref(),
            auth.tls.as_ref(),
            self.timeout,
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                warn!(host, port, error = %e, "failed to connect to replica");
                return ReplicaStatus::unknown();
            }
        };

        let info = tokio::time::timeout(self.timeout, client.info_replication()).await;
        client.close().await;

        match info {
            Ok(Ok(info)) => {
                debug!(
                    host,
                    port,
                    master_link_status = info.master_link_status.as_deref().unwrap_or("-"),
                    master_repl_offset = ?info.master_repl_offset,
                    "replication info"
                );
                info.status()
            }
            Ok(Err(e)) => {
                warn!(host, port, error = %e, "failed to query replication info");
                ReplicaStatus::unknown()
            }
            Err(_) => {
                warn!(host, port, timeout = ?self.timeout, "replication info query timed out");
                ReplicaStatus::unknown()
            }
        }
    }
}

/// Role of every probed replica, in discovery (ordinal) order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    replicas: Vec<(i32, ReplicaStatus)>,
}

impl TopologySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, ordinal: i32, status: ReplicaStatus) {
        self.replicas.push((ordinal, status));
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(i32, ReplicaStatus)> {
        self.replicas.iter()
    }

    /// Replicas reporting `master`, in discovery order.
    pub fn masters(&self) -> impl Iterator<Item = &(i32, ReplicaStatus)> {
        self.replicas.iter().filter(|(_, s)| s.role == RedisRole::Master)
    }
}

impl FromIterator<(i32, ReplicaStatus)> for TopologySnapshot {
    fn from_iter<I: IntoIterator<Item = (i32, ReplicaStatus)>>(iter: I) -> Self {
        Self {
            replicas: iter.into_iter().collect(),
        }
    }
}

/// Pick the canonical master of a snapshot.
///
/// - no master: `None`
/// - one master: that one
/// - several masters: the first with attached replicas; if none has any,
///   `None`. A split brain without attachments is reported as "no master"
///   rather than as a distinct condition.
pub fn select_master(snapshot: &TopologySnapshot) -> Option<i32> {
    let masters: Vec<_> = snapshot.masters().collect();
    match masters.as_slice() {
        [] => None,
        [(ordinal, _)] => Some(*ordinal),
        several => several
            .iter()
            .find(|(_, status)| status.connected_slaves > 0)
            .map(|(ordinal, _)| *ordinal),
    }
}

/// Render a pod IP as a host literal: IPv6 in brackets, anything else
/// (IPv4 and IPv4-mapped IPv6) unchanged.
pub fn format_address(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) if v6.to_ipv4_mapped().is_none() => format!("[{}]", ip),
        Ok(_) => ip.to_string(),
        Err(_) => format!("[{}]", ip),
    }
}

/// Phases of one [`RedisProber`] probe that can each run up to the probe
/// timeout: connect, `INFO replication` and `QUIT`.
pub const PROBE_PHASES: u32 = 3;

/// Upper bound for discovering `replicas` ordinals: every phase of every
/// probe at its full timeout, plus one timeout spare.
pub fn discovery_deadline(probe_timeout: Duration, replicas: i32) -> Duration {
    let phases = u32::try_from(replicas.max(0))
        .unwrap_or(0)
        .saturating_mul(PROBE_PHASES)
        .saturating_add(1);
    probe_timeout.saturating_mul(phases)
}

/// A snapshot and whether every ordinal was probed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub snapshot: TopologySnapshot,
    pub complete: bool,
}

/// The replica currently acting as master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterLocation {
    pub pod: String,
    pub address: String,
}

/// Resolves the current master of a RedisReplication.
pub struct MasterResolver<'a> {
    reader: &'a dyn ClusterReader,
    prober: &'a dyn ReplicaProber,
    span: Span,
    deadline: Option<Duration>,
    probe_budget: Option<Duration>,
}

impl<'a> MasterResolver<'a> {
    pub fn new(reader: &'a dyn ClusterReader, prober: &'a dyn ReplicaProber, span: Span) -> Self {
        Self {
            reader,
            prober,
            span,
            deadline: None,
            probe_budget: None,
        }
    }

    /// Abort discovery of the remaining ordinals after `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Size the deadline from the replication with [`discovery_deadline`],
    /// so that unreachable replicas alone never exhaust it. An explicit
    /// [`with_deadline`](Self::with_deadline) wins.
    pub fn with_probe_budget(mut self, probe_timeout: Duration) -> Self {
        self.probe_budget = Some(probe_timeout);
        self
    }

    /// Look up a replication by name and resolve its master.
    ///
    /// A missing or malformed replication yields `None`.
    pub async fn resolve_reference(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let replication = match self.reader.get_replication(namespace, name).await {
            Ok(Some(replication)) => replication,
            Ok(None) => {
                warn!(parent: &self.span, replication = name, "referenced replication not found");
                return Ok(None);
            }
            Err(e) => {
                warn!(parent: &self.span, replication = name, error = %e, "failed to read referenced replication");
                return Ok(None);
            }
        };
        self.resolve(&replication).await
    }

    /// Address of the replication's master, or `None` if there is none.
    pub async fn resolve(&self, replication: &RedisReplication) -> Result<Option<String>> {
        Ok(self.locate(replication).await?.map(|master| master.address))
    }

    /// Pod and address of the replication's master.
    pub async fn locate(&self, replication: &RedisReplication) -> Result<Option<MasterLocation>> {
        async {
            let auth = AuthContext::for_replication(self.reader, replication).await?;
            let discovery = self.discover(replication, &auth).await;
            if !discovery.complete {
                warn!(
                    probed = discovery.snapshot.len(),
                    "topology discovery hit its deadline"
                );
                return Ok(None);
            }

            let Some(ordinal) = select_master(&discovery.snapshot) else {
                error!(
                    masters = discovery.snapshot.masters().count(),
                    "no usable master found"
                );
                return Ok(None);
            };

            let namespace = replication.namespace().unwrap_or_default();
            let pod = pod_name(&replication.name_any(), ordinal);
            match self.reader.pod_ip(&namespace, &pod).await {
                Ok(Some(ip)) => {
                    let address = format_address(&ip);
                    info!(pod = %pod, address = %address, "resolved master");
                    Ok(Some(MasterLocation { pod, address }))
                }
                Ok(None) => {
                    warn!(pod = %pod, "master pod has no IP");
                    Ok(None)
                }
                Err(e) => {
                    warn!(pod = %pod, error = %e, "failed to read master pod");
                    Ok(None)
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Probe ordinals `0..clusterSize` sequentially.
    pub async fn discover(
        &self,
        replication: &RedisReplication,
        auth: &AuthContext,
    ) -> Discovery {
        let namespace = replication.namespace().unwrap_or_default();
        let workload = replication.name_any();
        let deadline = self
            .deadline
            .or_else(|| {
                self.probe_budget
                    .map(|b| discovery_deadline(b, replication.spec.cluster_size))
            })
            .map(|d| Instant::now() + d);
        let mut snapshot = TopologySnapshot::new();

        for ordinal in 0..replication.spec.cluster_size {
            let step = self.probe_ordinal(&namespace, &workload, ordinal, auth);
            let status = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, step).await {
                    Ok(status) => status,
                    Err(_) => {
                        return Discovery {
                            snapshot,
                            complete: false,
                        };
                    }
                },
                None => step.await,
            };
            snapshot.record(ordinal, status);
        }

        Discovery {
            snapshot,
            complete: true,
        }
    }

    async fn probe_ordinal(
        &self,
        namespace: &str,
        workload: &str,
        ordinal: i32,
        auth: &AuthContext,
    ) -> ReplicaStatus {
        let pod = pod_name(workload, ordinal);
        let ip = match self.reader.pod_ip(namespace, &pod).await {
            Ok(Some(ip)) => ip,
            Ok(None) => {
                debug!(pod = %pod, "pod has no IP yet");
                return ReplicaStatus::unknown();
            }
            Err(e) => {
                warn!(pod = %pod, error = %e, "failed to read pod");
                return ReplicaStatus::unknown();
            }
        };
        let status = self.prober.probe(&ip, REDIS_PORT as u16, auth).await;
        debug!(pod = %pod, role = %status.role, connected_slaves = status.connected_slaves, "probed replica");
        status
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
    use crate::controller::store::MockClusterReader;
    use crate::crd::{ExistingPasswordSecret, RedisReplicationSpec, TlsConfig};
    use k8s_openapi::api::core::v1::SecretVolumeSource;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn snapshot(statuses: &[ReplicaStatus]) -> TopologySnapshot {
        statuses
            .iter()
            .enumerate()
            .map(|(i, s)| (i as i32, *s))
            .collect()
    }

    fn replication(size: i32) -> RedisReplication {
        RedisReplication {
            metadata: ObjectMeta {
                name: Some("cache".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: RedisReplicationSpec {
                cluster_size: size,
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn test_select_master_no_master() {
        let s = snapshot(&[ReplicaStatus::replica(), ReplicaStatus::replica()]);
        assert_eq!(select_master(&s), None);
        assert_eq!(select_master(&TopologySnapshot::new()), None);
    }

    #[test]
    fn test_select_master_single_master() {
        let s = snapshot(&[ReplicaStatus::master(2), ReplicaStatus::replica()]);
        assert_eq!(select_master(&s), Some(0));
        // A lone master wins even without attached replicas.
        let s = snapshot(&[ReplicaStatus::unknown(), ReplicaStatus::master(0)]);
        assert_eq!(select_master(&s), Some(1));
    }

    #[test]
    fn test_select_master_split_brain_one_eligible() {
        let s = snapshot(&[ReplicaStatus::master(0), ReplicaStatus::master(1)]);
        assert_eq!(select_master(&s), Some(1));
    }

    #[test]
    fn test_select_master_split_brain_first_eligible_wins() {
        let s = snapshot(&[
            ReplicaStatus::master(0),
            ReplicaStatus::master(2),
            ReplicaStatus::master(1),
        ]);
        assert_eq!(select_master(&s), Some(1));
    }

    #[test]
    fn test_select_master_split_brain_none_eligible() {
        let s = snapshot(&[ReplicaStatus::master(0), ReplicaStatus::master(0)]);
        assert_eq!(select_master(&s), None);
    }

    #[test]
    fn test_discovery_deadline() {
        assert_eq!(
            discovery_deadline(Duration::from_secs(5), 3),
            Duration::from_secs(50)
        );
        assert_eq!(
            discovery_deadline(Duration::from_secs(5), -1),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_format_address() {
        assert_eq!(format_address("10.0.0.5"), "10.0.0.5");
        assert_eq!(format_address("fd00::5"), "[fd00::5]");
        assert_eq!(format_address("::ffff:10.0.0.5"), "::ffff:10.0.0.5");
        assert_eq!(format_address("not-an-ip"), "[not-an-ip]");
    }

    fn reader_with_ips(ips: &'static [(&'static str, &'static str)]) -> MockClusterReader {
        let mut reader = MockClusterReader::new();
        reader.expect_pod_ip().returning(move |_, pod| {
            Ok(ips
                .iter()
                .find(|(name, _)| *name == pod)
                .map(|(_, ip)| ip.to_string()))
        });
        reader
    }

    #[tokio::test]
    async fn test_resolve_single_master() {
        let reader = reader_with_ips(&[("cache-0", "10.0.0.1"), ("cache-1", "10.0.0.2")]);
        let mut prober = MockReplicaProber::new();
        prober.expect_probe().times(2).returning(|host, port, _| {
            assert_eq!(port, 6379);
            if host == "10.0.0.1" {
                ReplicaStatus::master(1)
            } else {
                ReplicaStatus::replica()
            }
        });

        let resolver = MasterResolver::new(&reader, &prober, Span::none());
        let address = resolver.resolve(&replication(2)).await.unwrap();
        assert_eq!(address.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_locate_reports_master_pod() {
        let reader = reader_with_ips(&[
            ("cache-0", "10.0.0.1"),
            ("cache-1", "10.0.0.2"),
            ("cache-2", "10.0.0.3"),
        ]);
        let mut prober = MockReplicaProber::new();
        prober.expect_probe().returning(|host, _, _| {
            if host == "10.0.0.3" {
                ReplicaStatus::master(2)
            } else {
                ReplicaStatus::replica()
            }
        });

        let resolver = MasterResolver::new(&reader, &prober, Span::none());
        let master = resolver.locate(&replication(3)).await.unwrap().unwrap();
        assert_eq!(
            master,
            MasterLocation {
                pod: "cache-2".to_string(),
                address: "10.0.0.3".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_ipv6_master_is_bracketed() {
        let reader = reader_with_ips(&[("cache-0", "fd00::1")]);
        let mut prober = MockReplicaProber::new();
        prober
            .expect_probe()
            .returning(|_, _, _| ReplicaStatus::master(0));

        let resolver = MasterResolver::new(&reader, &prober, Span::none());
        let address = resolver.resolve(&replication(1)).await.unwrap();
        assert_eq!(address.as_deref(), Some("[fd00::1]"));
    }

    #[tokio::test]
    async fn test_pod_without_ip_is_unknown() {
        let reader = reader_with_ips(&[("cache-1", "10.0.0.2")]);
        let mut prober = MockReplicaProber::new();
        prober
            .expect_probe()
            .times(1)
            .returning(|_, _, _| ReplicaStatus::replica());

        let resolver = MasterResolver::new(&reader, &prober, Span::none());
        let discovery = resolver
            .discover(&replication(2), &AuthContext::default())
            .await;
        assert!(discovery.complete);
        let roles: Vec<_> = discovery.snapshot.iter().map(|(_, s)| s.role).collect();
        assert_eq!(roles, vec![RedisRole::Unknown, RedisRole::Replica]);
    }

    #[tokio::test]
    async fn test_missing_password_secret_is_configuration_error() {
        let mut reader = MockClusterReader::new();
        reader.expect_secret_data().returning(|_, _| Ok(None));
        reader.expect_pod_ip().never();
        let prober = MockReplicaProber::new();

        let mut rr = replication(2);
        rr.spec.kubernetes_config.redis_secret = Some(ExistingPasswordSecret {
            name: "redis-auth".to_string(),
            key: "password".to_string(),
        });

        let resolver = MasterResolver::new(&reader, &prober, Span::none());
        let err = resolver.resolve(&rr).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_auth_context_loads_password_and_tls() {
        let mut reader = MockClusterReader::new();
        reader.expect_secret_data().returning(|_, name| {
            let data = match name {
                "redis-auth" => BTreeMap::from([("password".to_string(), b"s3cret".to_vec())]),
                _ => BTreeMap::from([
                    ("ca.crt".to_string(), b"ca".to_vec()),
                    ("tls.crt".to_string(), b"cert".to_vec()),
                    ("tls.key".to_string(), b"key".to_vec()),
                ]),
            };
            Ok(Some(data))
        });

        let mut rr = replication(1);
        rr.spec.kubernetes_config.redis_secret = Some(ExistingPasswordSecret {
            name: "redis-auth".to_string(),
            key: "password".to_string(),
        });
        rr.spec.tls = Some(TlsConfig {
            secret: SecretVolumeSource {
                secret_name: Some("redis-tls".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        let auth = AuthContext::for_replication(&reader, &rr).await.unwrap();
        assert_eq!(auth.password.as_deref(), Some("s3cret"));
        let tls = auth.tls.unwrap();
        assert_eq!(tls.ca_cert_pem, b"ca");
        assert_eq!(tls.client_key_pem.as_deref(), Some(&b"key"[..]));
        let debug = format!(
            "{:?}",
            AuthContext {
                password: Some("s3cret".to_string()),
                tls: None,
            }
        );
        assert!(!debug.contains("s3cret"));
    }

    #[tokio::test]
    async fn test_cross_resource_failures_yield_none() {
        let mut reader = MockClusterReader::new();
        reader.expect_get_replication().returning(|_, name| {
            if name == "missing" {
                Ok(None)
            } else {
                Err(Error::Serialization(
                    serde_json::from_str::<serde_json::Value>("not json").unwrap_err(),
                ))
            }
        });
        let prober = MockReplicaProber::new();

        let resolver = MasterResolver::new(&reader, &prober, Span::none());
        assert_eq!(
            resolver.resolve_reference("default", "missing").await.unwrap(),
            None
        );
        assert_eq!(
            resolver.resolve_reference("default", "broken").await.unwrap(),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_replicas_do_not_hide_master() {
        const TIMEOUT: Duration = Duration::from_millis(300);

        /// Replicas that hang through every phase of the probe, then a master.
        struct HangingProber;

        #[async_trait]
        impl ReplicaProber for HangingProber {
            async fn probe(&self, host: &str, _: u16, _: &AuthContext) -> ReplicaStatus {
                if host == "10.0.0.3" {
                    return ReplicaStatus::master(0);
                }
                tokio::time::sleep(TIMEOUT * PROBE_PHASES).await;
                ReplicaStatus::unknown()
            }
        }

        let reader = reader_with_ips(&[
            ("cache-0", "10.0.0.1"),
            ("cache-1", "10.0.0.2"),
            ("cache-2", "10.0.0.3"),
        ]);
        let prober = HangingProber;
        let resolver =
            MasterResolver::new(&reader, &prober, Span::none()).with_probe_budget(TIMEOUT);

        let discovery = resolver
            .discover(&replication(3), &AuthContext::default())
            .await;
        assert!(discovery.complete);
        assert_eq!(
            resolver.resolve(&replication(3)).await.unwrap().as_deref(),
            Some("10.0.0.3")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_remaining_ordinals() {
        struct SlowProber;

        #[async_trait]
        impl ReplicaProber for SlowProber {
            async fn probe(&self, _: &str, _: u16, _: &AuthContext) -> ReplicaStatus {
                tokio::time::sleep(Duration::from_secs(2)).await;
                ReplicaStatus::master(1)
            }
        }

        let reader = reader_with_ips(&[
            ("cache-0", "10.0.0.1"),
            ("cache-1", "10.0.0.2"),
            ("cache-2", "10.0.0.3"),
        ]);
        let prober = SlowProber;
        let resolver =
            MasterResolver::new(&reader, &prober, Span::none()).with_deadline(Duration::from_secs(3));

        let discovery = resolver
            .discover(&replication(3), &AuthContext::default())
            .await;
        assert!(!discovery.complete);
        assert_eq!(discovery.snapshot.len(), 1);

        // An incomplete snapshot never produces an address.
        assert_eq!(resolver.resolve(&replication(3)).await.unwrap(), None);
    }
}
