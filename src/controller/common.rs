//! Shared controller helpers.
//!
//! Utilities used by both the RedisReplication and RedisSentinel controllers.

use kube::api::{Api, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::Error;

/// Finalizer guarding cleanup of both resource kinds.
pub const FINALIZER: &str = "redis.opstreelabs.in/finalizer";

pub fn has_finalizer<T: Resource>(resource: &T) -> bool {
    resource.finalizers().iter().any(|f| f == FINALIZER)
}

/// Add [`FINALIZER`] to a resource.
pub async fn add_finalizer<T>(api: &Api<T>, name: &str) -> Result<(), Error>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let resource = api.get(name).await?;
    let mut finalizers = resource.finalizers().to_vec();

    if !finalizers.iter().any(|f| f == FINALIZER) {
        finalizers.push(FINALIZER.to_string());
        patch_finalizers(api, name, finalizers).await?;
    }
    Ok(())
}

/// Remove [`FINALIZER`] from a resource. A resource already gone is fine.
pub async fn remove_finalizer<T>(api: &Api<T>, name: &str) -> Result<(), Error>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let resource = match api.get(name).await {
        Ok(r) => r,
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut finalizers = resource.finalizers().to_vec();
    if let Some(pos) = finalizers.iter().position(|f| f == FINALIZER) {
        finalizers.remove(pos);
        patch_finalizers(api, name, finalizers).await?;
    }
    Ok(())
}

async fn patch_finalizers<T>(api: &Api<T>, name: &str, finalizers: Vec<String>) -> Result<(), Error>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Server-side apply `object` under the operator's field manager.
pub async fn apply<T>(api: &Api<T>, object: &T) -> Result<(), Error>
where
    T: Resource + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let name = object.name_any();
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(object),
    )
    .await?;
    debug!(kind = %T::kind(&Default::default()), name = %name, "applied");
    Ok(())
}

/// Merge-patch the status subresource.
pub async fn patch_status<T, S>(api: &Api<T>, name: &str, status: &S) -> Result<(), Error>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
    S: Serialize,
{
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}
