//! Access to cluster-stored objects.
//!
//! [`StateStore`] covers the objects the converger writes (StatefulSets and
//! their volume claims); [`ClusterReader`] covers read-only lookups used for
//! topology discovery. [`KubeStore`] implements both over `kube::Api`.
//!
//! Error mapping follows the converger's needs: a missing object is `None`,
//! HTTP 422 `Invalid` is [`Error::InvalidStructural`], HTTP 409 is
//! [`Error::Conflict`], anything else is [`Error::Kube`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::{Error, Result};
use crate::crd::RedisReplication;
use crate::resources::common::label_selector_string;

const STATEFULSET: &str = "StatefulSet";
const CLAIM: &str = "PersistentVolumeClaim";

/// Typed get/create/update/delete over the objects a reconcile pass writes.
///
/// Updates carry the observed `resourceVersion`; a concurrent writer makes
/// them fail with [`Error::Conflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch a StatefulSet, `None` if it does not exist.
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;

    async fn create_statefulset(&self, namespace: &str, sts: &StatefulSet)
    -> Result<StatefulSet>;

    async fn update_statefulset(&self, namespace: &str, sts: &StatefulSet)
    -> Result<StatefulSet>;

    /// Delete with foreground propagation. Deleting a missing object succeeds.
    async fn delete_statefulset(&self, namespace: &str, name: &str) -> Result<()>;

    /// List claims carrying every label in `selector`.
    async fn list_claims(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>>;

    async fn update_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    /// Deleting a missing claim succeeds.
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Read-only lookups used while discovering the live topology.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Current IP of a pod; `None` if the pod is missing or not yet scheduled.
    async fn pod_ip(&self, namespace: &str, name: &str) -> Result<Option<String>>;

    /// Decoded data of a secret, `None` if the secret does not exist.
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>>;

    /// A RedisReplication referenced by name from another resource.
    async fn get_replication(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RedisReplication>>;
}

/// Value of `key` in secret `name`.
///
/// A missing secret or key is a configuration error: the resource points at
/// credentials that do not exist.
pub async fn secret_value(
    reader: &dyn ClusterReader,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<Vec<u8>> {
    let data = reader
        .secret_data(namespace, name)
        .await?
        .ok_or_else(|| Error::Configuration(format!("secret {}/{} not found", namespace, name)))?;
    data.get(key).cloned().ok_or_else(|| {
        Error::Configuration(format!(
            "key {} not found in secret {}/{}",
            key, namespace, name
        ))
    })
}

/// [`StateStore`] and [`ClusterReader`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl StateStore for KubeStore {
    #[instrument(skip(self))]
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::from_store(STATEFULSET, name, e))
    }

    #[instrument(skip(self, sts), fields(name = %sts.name_any()))]
    async fn create_statefulset(
        &self,
        namespace: &str,
        sts: &StatefulSet,
    ) -> Result<StatefulSet> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.create(&Self::post_params(), sts)
            .await
            .map_err(|e| Error::from_store(STATEFULSET, &sts.name_any(), e))
    }

    #[instrument(skip(self, sts), fields(name = %sts.name_any()))]
    async fn update_statefulset(
        &self,
        namespace: &str,
        sts: &StatefulSet,
    ) -> Result<StatefulSet> {
        let name = sts.name_any();
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&name, &Self::post_params(), sts)
            .await
            .map_err(|e| Error::from_store(STATEFULSET, &name, e))
    }

    #[instrument(skip(self))]
    async fn delete_statefulset(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::foreground()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::from_store(STATEFULSET, name, e)),
        }
    }

    #[instrument(skip(self))]
    async fn list_claims(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector_string(selector));
        let claims = api.list(&params).await?;
        Ok(claims.items)
    }

    #[instrument(skip(self, claim), fields(name = %claim.name_any()))]
    async fn update_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let name = claim.name_any();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&name, &Self::post_params(), claim)
            .await
            .map_err(|e| Error::from_store(CLAIM, &name, e))
    }

    #[instrument(skip(self))]
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::from_store(CLAIM, name, e)),
        }
    }
}

#[async_trait]
impl ClusterReader for KubeStore {
    #[instrument(skip(self))]
    async fn pod_ip(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api.get_opt(name).await?;
        Ok(pod
            .and_then(|p| p.status)
            .and_then(|s| s.pod_ip)
            .filter(|ip| !ip.is_empty()))
    }

    #[instrument(skip(self))]
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };
        let mut data: BTreeMap<String, Vec<u8>> = secret
            .string_data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.into_bytes()))
            .collect();
        data.extend(
            secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0)),
        );
        Ok(Some(data))
    }

    /// Generic read of the referenced object, round-tripped through JSON
    /// into the typed shape.
    #[instrument(skip(self))]
    async fn get_replication(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RedisReplication>> {
        let resource = ApiResource::erase::<RedisReplication>(&());
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let Some(object) = api.get_opt(name).await? else {
            debug!(namespace, name, "referenced replication not found");
            return Ok(None);
        };
        let value = serde_json::to_value(&object)?;
        match serde_json::from_value::<RedisReplication>(value) {
            Ok(replication) => Ok(Some(replication)),
            Err(e) => {
                warn!(namespace, name, error = %e, "referenced replication is malformed");
                Err(Error::Serialization(e))
            }
        }
    }
}
