//! In-memory object store for functional tests.
//!
//! `MemoryStore` implements both `StateStore` and `ClusterReader` the way the
//! API server behaves for the calls the engine makes:
//!
//! - every write bumps a global resource version
//! - updates carrying a stale `resourceVersion` fail with a conflict
//! - creating an existing object fails with a conflict (AlreadyExists)
//! - `selector`, `serviceName` and `volumeClaimTemplates` of a StatefulSet
//!   are immutable; changing them is rejected as structurally invalid
//! - a few spec fields are defaulted on write, like the real server does
//! - container resource quantities are stored in canonical notation
//!
//! Failures can be injected per call kind, and every write is recorded so
//! tests can assert on the exact sequence of store operations.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use redis_sentinel_operator::client::ReplicaStatus;
use redis_sentinel_operator::controller::error::{Error, Result};
use redis_sentinel_operator::controller::store::{ClusterReader, StateStore};
use redis_sentinel_operator::controller::topology::{AuthContext, ReplicaProber};
use redis_sentinel_operator::crd::RedisReplication;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// A store write, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    CreateStatefulSet(String),
    UpdateStatefulSet(String),
    DeleteStatefulSet(String),
    UpdateClaim(String),
    DeleteClaim(String),
}

#[derive(Default)]
struct State {
    version: u64,
    uid: u64,
    statefulsets: BTreeMap<Key, StatefulSet>,
    claims: BTreeMap<Key, PersistentVolumeClaim>,
    pod_ips: BTreeMap<Key, String>,
    secrets: BTreeMap<Key, BTreeMap<String, Vec<u8>>>,
    replications: BTreeMap<Key, RedisReplication>,
    malformed_replications: HashSet<Key>,
    failing_claims: HashSet<String>,
    reject_updates: bool,
    conflict_next_update: bool,
    unavailable: bool,
    writes: Vec<Write>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn next_uid(&mut self) -> String {
        self.uid += 1;
        format!("00000000-0000-4000-8000-{:012}", self.uid)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::Transient("apiserver unavailable".to_string()));
        }
        Ok(())
    }
}

/// Server-side defaulting applied on every StatefulSet write.
fn apply_defaults(sts: &mut StatefulSet) {
    let Some(spec) = sts.spec.as_mut() else {
        return;
    };
    spec.revision_history_limit.get_or_insert(10);
    spec.pod_management_policy
        .get_or_insert_with(|| "OrderedReady".to_string());

    let containers = spec
        .template
        .spec
        .iter_mut()
        .flat_map(|pod| pod.containers.iter_mut());
    for container in containers {
        let Some(resources) = container.resources.as_mut() else {
            continue;
        };
        for quantities in [resources.requests.as_mut(), resources.limits.as_mut()]
            .into_iter()
            .flatten()
        {
            for quantity in quantities.values_mut() {
                quantity.0 = canonical_quantity(&quantity.0);
            }
        }
    }
}

/// The subset of the server's quantity canonicalization the tests rely on:
/// whole milli-units collapse to units and binary suffixes are promoted.
fn canonical_quantity(quantity: &str) -> String {
    if let Some(milli) = quantity.strip_suffix('m').and_then(|n| n.parse::<i64>().ok()) {
        if milli % 1000 == 0 {
            return (milli / 1000).to_string();
        }
        return quantity.to_string();
    }

    const BINARY: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
    for (index, suffix) in BINARY.iter().enumerate() {
        if let Some(mut amount) = quantity.strip_suffix(suffix).and_then(|n| n.parse::<i64>().ok()) {
            let mut index = index;
            while amount != 0 && amount % 1024 == 0 && index + 1 < BINARY.len() {
                amount /= 1024;
                index += 1;
            }
            return format!("{}{}", amount, BINARY[index]);
        }
    }
    quantity.to_string()
}

fn immutable_fields(sts: &StatefulSet) -> serde_json::Value {
    let spec = sts.spec.as_ref();
    serde_json::json!({
        "selector": spec.map(|s| &s.selector),
        "serviceName": spec.and_then(|s| s.service_name.as_ref()),
        "volumeClaimTemplates": spec.and_then(|s| s.volume_claim_templates.as_ref()),
    })
}

fn conflict(kind: &str, name: &str, message: &str) -> Error {
    Error::Conflict {
        kind: kind.to_string(),
        name: name.to_string(),
        message: message.to_string(),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[allow(clippy::unwrap_used)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Current resource version counter.
    pub fn version(&self) -> u64 {
        self.state().version
    }

    pub fn statefulset(&self, namespace: &str, name: &str) -> Option<StatefulSet> {
        self.state().statefulsets.get(&key(namespace, name)).cloned()
    }

    /// Mutate a stored StatefulSet out of band, bumping its version.
    pub fn edit_statefulset(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut StatefulSet)) {
        let mut state = self.state();
        let version = state.next_version();
        let sts = state.statefulsets.get_mut(&key(namespace, name)).unwrap();
        edit(sts);
        sts.metadata.resource_version = Some(version);
    }

    pub fn insert_claim(&self, namespace: &str, mut claim: PersistentVolumeClaim) {
        let mut state = self.state();
        claim.metadata.resource_version = Some(state.next_version());
        let name = claim.name_any();
        state.claims.insert(key(namespace, &name), claim);
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.state().claims.get(&key(namespace, name)).cloned()
    }

    pub fn claim_names(&self, namespace: &str) -> Vec<String> {
        self.state()
            .claims
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn set_pod_ip(&self, namespace: &str, pod: &str, ip: &str) {
        self.state()
            .pod_ips
            .insert(key(namespace, pod), ip.to_string());
    }

    pub fn insert_secret(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let data = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        self.state().secrets.insert(key(namespace, name), data);
    }

    pub fn insert_replication(&self, replication: RedisReplication) {
        let k = key(
            &replication.namespace().unwrap_or_default(),
            &replication.name_any(),
        );
        self.state().replications.insert(k, replication);
    }

    /// Make the typed read of a replication fail to deserialize.
    pub fn corrupt_replication(&self, namespace: &str, name: &str) {
        self.state()
            .malformed_replications
            .insert(key(namespace, name));
    }

    /// Fail every update of the named claim.
    pub fn fail_claim_updates(&self, name: &str) {
        self.state().failing_claims.insert(name.to_string());
    }

    pub fn heal_claim_updates(&self) {
        self.state().failing_claims.clear();
    }

    /// Reject every StatefulSet update as structurally invalid.
    pub fn reject_updates(&self, reject: bool) {
        self.state().reject_updates = reject;
    }

    /// Let a concurrent writer win the next StatefulSet update.
    pub fn conflict_next_update(&self) {
        self.state().conflict_next_update = true;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn writes(&self) -> Vec<Write> {
        self.state().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }
}

#[async_trait]
#[allow(clippy::unwrap_used)]
impl StateStore for MemoryStore {
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        let state = self.state();
        state.check_available()?;
        Ok(state.statefulsets.get(&key(namespace, name)).cloned())
    }

    async fn create_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        let mut state = self.state();
        state.check_available()?;
        let name = sts.name_any();
        if state.statefulsets.contains_key(&key(namespace, &name)) {
            return Err(conflict("StatefulSet", &name, "already exists"));
        }

        let mut stored = sts.clone();
        apply_defaults(&mut stored);
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some(state.next_version());
        stored.metadata.uid = Some(state.next_uid());
        stored.metadata.generation = Some(1);
        state.statefulsets.insert(key(namespace, &name), stored.clone());
        state.writes.push(Write::CreateStatefulSet(name));
        Ok(stored)
    }

    async fn update_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        let mut state = self.state();
        state.check_available()?;
        let name = sts.name_any();
        let Some(current) = state.statefulsets.get(&key(namespace, &name)).cloned() else {
            return Err(Error::Transient(format!("statefulset {} not found", name)));
        };

        if std::mem::take(&mut state.conflict_next_update)
            || current.metadata.resource_version != sts.metadata.resource_version
        {
            return Err(conflict(
                "StatefulSet",
                &name,
                "the object has been modified; please apply your changes to the latest version",
            ));
        }

        let mut stored = sts.clone();
        apply_defaults(&mut stored);
        if state.reject_updates || immutable_fields(&current) != immutable_fields(&stored) {
            return Err(Error::InvalidStructural {
                kind: "StatefulSet".to_string(),
                name,
                message: "spec: Forbidden: updates to statefulset spec for fields other than \
                          'replicas', 'template', 'updateStrategy' and 'minReadySeconds' are forbidden"
                    .to_string(),
            });
        }

        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.resource_version = Some(state.next_version());
        stored.metadata.generation = current.metadata.generation.map(|g| g + 1);
        stored.status = current.status.clone();
        state.statefulsets.insert(key(namespace, &name), stored.clone());
        state.writes.push(Write::UpdateStatefulSet(name));
        Ok(stored)
    }

    async fn delete_statefulset(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.check_available()?;
        if state.statefulsets.remove(&key(namespace, name)).is_some() {
            state.writes.push(Write::DeleteStatefulSet(name.to_string()));
        }
        Ok(())
    }

    async fn list_claims(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let state = self.state();
        state.check_available()?;
        Ok(state
            .claims
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, claim)| claim)
            .filter(|claim| {
                let labels = claim.labels();
                selector.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn update_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let mut state = self.state();
        state.check_available()?;
        let name = claim.name_any();
        if state.failing_claims.contains(&name) {
            return Err(Error::Transient(format!(
                "exceeded quota while resizing {}",
                name
            )));
        }
        let Some(current) = state.claims.get(&key(namespace, &name)) else {
            return Err(Error::Transient(format!("claim {} not found", name)));
        };
        if current.metadata.resource_version != claim.metadata.resource_version {
            return Err(conflict("PersistentVolumeClaim", &name, "stale version"));
        }

        let mut stored = claim.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.claims.insert(key(namespace, &name), stored.clone());
        state.writes.push(Write::UpdateClaim(name));
        Ok(stored)
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.check_available()?;
        if state.claims.remove(&key(namespace, name)).is_some() {
            state.writes.push(Write::DeleteClaim(name.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterReader for MemoryStore {
    async fn pod_ip(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let state = self.state();
        state.check_available()?;
        Ok(state.pod_ips.get(&key(namespace, name)).cloned())
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let state = self.state();
        state.check_available()?;
        Ok(state.secrets.get(&key(namespace, name)).cloned())
    }

    async fn get_replication(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RedisReplication>> {
        let state = self.state();
        state.check_available()?;
        if state.malformed_replications.contains(&key(namespace, name)) {
            let err = serde_json::from_value::<RedisReplication>(serde_json::json!({
                "metadata": {"name": name},
                "spec": {"clusterSize": "three"}
            }));
            return Err(err.err().map(Error::from).unwrap_or_else(|| {
                Error::Transient(format!("replication {} is malformed", name))
            }));
        }
        Ok(state.replications.get(&key(namespace, name)).cloned())
    }
}

/// Prober answering from a fixed table of host → status.
#[derive(Default)]
pub struct TableProber {
    statuses: Mutex<BTreeMap<String, ReplicaStatus>>,
    probed: Mutex<Vec<String>>,
}

#[allow(clippy::unwrap_used)]
impl TableProber {
    pub fn new(statuses: &[(&str, ReplicaStatus)]) -> Self {
        Self {
            statuses: Mutex::new(
                statuses
                    .iter()
                    .map(|(host, status)| (host.to_string(), *status))
                    .collect(),
            ),
            probed: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, host: &str, status: ReplicaStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(host.to_string(), status);
    }

    /// Hosts probed so far, in order.
    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
#[allow(clippy::unwrap_used)]
impl ReplicaProber for TableProber {
    async fn probe(&self, host: &str, _port: u16, _auth: &AuthContext) -> ReplicaStatus {
        self.probed.lock().unwrap().push(host.to_string());
        self.statuses
            .lock()
            .unwrap()
            .get(host)
            .copied()
            .unwrap_or_else(ReplicaStatus::unknown)
    }
}
