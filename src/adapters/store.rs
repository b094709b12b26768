//! Authoritative workload store
//!
//! Writes are guarded by the version token of the snapshot they were derived
//! from, so a concurrent writer is detected instead of overwritten.

use std::marker::PhantomData;

use async_trait::async_trait;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};

use crate::workload::Workload;
use crate::{Error, Result};

/// Field manager recorded on updates
pub const FIELD_MANAGER: &str = "image-clone-controller";

/// Opaque version marker of a fetched object (the Kubernetes `resourceVersion`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionToken(pub String);

/// A fetched workload together with the version it was read at
#[derive(Debug, Clone)]
pub struct Snapshot<K> {
    pub workload: K,
    pub version: VersionToken,
}

/// Result of a version-guarded write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    /// The write was accepted
    Committed,
    /// The object changed since it was read
    Conflict,
    /// The object was deleted since it was read
    NotFound,
}

/// Read and write access to one workload kind
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    type Kind: Workload;

    /// Fetch the current object, `None` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Snapshot<Self::Kind>>>;

    /// Replace the object, accepted only if its version still equals `version`
    async fn update(&self, workload: &Self::Kind, version: &VersionToken) -> Result<UpdateResult>;
}

/// [`WorkloadStore`] backed by the Kubernetes API server
pub struct KubeWorkloadStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeWorkloadStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K: Workload> WorkloadStore for KubeWorkloadStore<K> {
    type Kind = K;

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Snapshot<K>>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let fetch_error = |message: String| Error::StoreFetchError {
            kind: K::KIND.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            message,
        };

        let Some(workload) = api
            .get_opt(name)
            .await
            .map_err(|e| fetch_error(e.to_string()))?
        else {
            return Ok(None);
        };

        let version = workload
            .resource_version()
            .ok_or_else(|| fetch_error("object has no resourceVersion".to_string()))?;

        Ok(Some(Snapshot {
            workload,
            version: VersionToken(version),
        }))
    }

    async fn update(&self, workload: &K, version: &VersionToken) -> Result<UpdateResult> {
        let namespace = workload.namespace().unwrap_or_default();
        let name = workload.name_any();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);

        let mut desired = workload.clone();
        desired.meta_mut().resource_version = Some(version.0.clone());

        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        match api.replace(&name, &params, &desired).await {
            Ok(_) => Ok(UpdateResult::Committed),
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(UpdateResult::Conflict),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(UpdateResult::NotFound),
            Err(e) => Err(Error::StoreUpdateError {
                kind: K::KIND.to_string(),
                namespace,
                name,
                message: e.to_string(),
            }),
        }
    }
}
