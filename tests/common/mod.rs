//! In-memory collaborators for reconciliation tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image_clone_controller::adapters::credentials::{CredentialProvider, Keychain};
use image_clone_controller::adapters::registry::RegistryMirror;
use image_clone_controller::adapters::store::{Snapshot, UpdateResult, VersionToken, WorkloadStore};
use image_clone_controller::image::MirrorNaming;
use image_clone_controller::reconcilers::image_clone::{AdmissionFilter, ImageCloner};
use image_clone_controller::workload::Workload;
use image_clone_controller::{Error, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Workload builders
// ============================================================================

fn metadata(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

fn pod_template(containers: &[(&str, &str)]) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: None,
        spec: Some(PodSpec {
            containers: containers
                .iter()
                .map(|(name, image)| Container {
                    name: name.to_string(),
                    image: (!image.is_empty()).then(|| image.to_string()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
    }
}

/// Deployment with `(container name, image)` pairs; an empty image means none
pub fn deployment(namespace: &str, name: &str, containers: &[(&str, &str)]) -> Deployment {
    Deployment {
        metadata: metadata(namespace, name),
        spec: Some(DeploymentSpec {
            template: pod_template(containers),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn daemon_set(namespace: &str, name: &str, containers: &[(&str, &str)]) -> DaemonSet {
    DaemonSet {
        metadata: metadata(namespace, name),
        spec: Some(DaemonSetSpec {
            template: pod_template(containers),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Images of a workload in container order
pub fn images<K: Workload>(workload: &K) -> Vec<String> {
    workload.containers().into_iter().map(|c| c.image).collect()
}

// ============================================================================
// Store
// ============================================================================

struct StoreState<K> {
    object: Option<K>,
    version: u64,
    conflicts_remaining: u32,
    delete_on_update: bool,
    fail_update: bool,
    fail_get: bool,
    gets: usize,
    updates: Vec<(K, VersionToken)>,
}

/// Store enforcing version-matched writes on a single object
pub struct FakeStore<K> {
    state: Mutex<StoreState<K>>,
}

impl<K: Workload> FakeStore<K> {
    pub fn with(object: K) -> Self {
        Self::new(Some(object))
    }

    pub fn empty() -> Self {
        Self::new(None)
    }

    fn new(object: Option<K>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                object,
                version: 1,
                conflicts_remaining: 0,
                delete_on_update: false,
                fail_update: false,
                fail_get: false,
                gets: 0,
                updates: Vec::new(),
            }),
        }
    }

    /// Let another writer change the object right before each of the next `n` commits
    pub fn conflict_times(self, n: u32) -> Self {
        self.state.lock().unwrap().conflicts_remaining = n;
        self
    }

    /// Delete the object right before the first commit
    pub fn delete_on_update(self) -> Self {
        self.state.lock().unwrap().delete_on_update = true;
        self
    }

    pub fn fail_update(self) -> Self {
        self.state.lock().unwrap().fail_update = true;
        self
    }

    pub fn fail_get(self) -> Self {
        self.state.lock().unwrap().fail_get = true;
        self
    }

    pub fn gets(&self) -> usize {
        self.state.lock().unwrap().gets
    }

    pub fn update_count(&self) -> usize {
        self.state.lock().unwrap().updates.len()
    }

    /// Version tokens passed to every update call
    pub fn update_tokens(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .updates
            .iter()
            .map(|(_, token)| token.0.clone())
            .collect()
    }

    pub fn current(&self) -> Option<K> {
        self.state.lock().unwrap().object.clone()
    }
}

#[async_trait]
impl<K: Workload> WorkloadStore for FakeStore<K> {
    type Kind = K;

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Snapshot<K>>> {
        let mut state = self.state.lock().unwrap();
        state.gets += 1;

        if state.fail_get {
            return Err(Error::StoreFetchError {
                kind: K::KIND.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: "connection refused".to_string(),
            });
        }

        let version = state.version;
        Ok(state.object.clone().map(|mut workload| {
            workload.meta_mut().resource_version = Some(version.to_string());
            Snapshot {
                workload,
                version: VersionToken(version.to_string()),
            }
        }))
    }

    async fn update(&self, workload: &K, version: &VersionToken) -> Result<UpdateResult> {
        let mut state = self.state.lock().unwrap();
        state.updates.push((workload.clone(), version.clone()));

        if state.fail_update {
            return Err(Error::StoreUpdateError {
                kind: K::KIND.to_string(),
                namespace: workload.namespace().unwrap_or_default(),
                name: workload.name_any(),
                message: "internal error".to_string(),
            });
        }

        if state.delete_on_update {
            state.object = None;
        }
        if state.object.is_none() {
            return Ok(UpdateResult::NotFound);
        }

        if state.conflicts_remaining > 0 {
            state.conflicts_remaining -= 1;
            state.version += 1;
        }

        if version.0 != state.version.to_string() {
            return Ok(UpdateResult::Conflict);
        }

        state.version += 1;
        state.object = Some(workload.clone());
        Ok(UpdateResult::Committed)
    }
}

// ============================================================================
// Registry and credentials
// ============================================================================

/// Registry recording every copy and failing for one chosen source image
#[derive(Default)]
pub struct FakeRegistry {
    copies: Mutex<Vec<(String, String)>>,
    failing_source: Mutex<Option<String>>,
    cancel_after_copy: Option<CancellationToken>,
}

impl FakeRegistry {
    pub fn failing_on(source: &str) -> Self {
        let registry = Self::default();
        *registry.failing_source.lock().unwrap() = Some(source.to_string());
        registry
    }

    /// Complete each copy, then cancel `shutdown` as if the process were stopping
    pub fn cancelling(shutdown: CancellationToken) -> Self {
        Self {
            cancel_after_copy: Some(shutdown),
            ..Self::default()
        }
    }

    pub fn heal(&self) {
        *self.failing_source.lock().unwrap() = None;
    }

    pub fn copies(&self) -> Vec<(String, String)> {
        self.copies.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryMirror for FakeRegistry {
    async fn copy(&self, source: &str, destination: &str, _keychain: &Keychain) -> Result<()> {
        self.copies
            .lock()
            .unwrap()
            .push((source.to_string(), destination.to_string()));

        if self.failing_source.lock().unwrap().as_deref() == Some(source) {
            return Err(Error::RegistryError(format!(
                "GET manifest for {} returned 503",
                source
            )));
        }

        if let Some(shutdown) = &self.cancel_after_copy {
            shutdown.cancel();
        }
        Ok(())
    }
}

/// Credential provider returning an empty keychain, optionally failing
#[derive(Default)]
pub struct FakeCredentials {
    calls: Mutex<Vec<String>>,
    fail: bool,
    stall: Option<CancellationToken>,
}

impl FakeCredentials {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Cancel `shutdown` and never answer, like a secret read hanging during shutdown
    pub fn stalling(shutdown: CancellationToken) -> Self {
        Self {
            stall: Some(shutdown),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn resolve(&self, image: &str) -> Result<Keychain> {
        self.calls.lock().unwrap().push(image.to_string());
        if let Some(shutdown) = &self.stall {
            shutdown.cancel();
            std::future::pending::<()>().await;
        }
        if self.fail {
            return Err(Error::CredentialError {
                image: image.to_string(),
                message: "pull secret is malformed".to_string(),
            });
        }
        Ok(Keychain::default())
    }
}

/// Reconciler with the default prefix and `kube-system` excluded
pub fn cloner(credentials: Arc<FakeCredentials>, registry: Arc<FakeRegistry>) -> ImageCloner {
    ImageCloner::new(
        AdmissionFilter::new(["kube-system"]),
        MirrorNaming::new("imageclone"),
        credentials,
        registry,
    )
}
