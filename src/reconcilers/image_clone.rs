//! Reconciliation logic that moves workload images onto the mirror
//!
//! For one `(kind, namespace, name)` notification: skip excluded namespaces,
//! fetch the workload fresh, plan which images still need mirroring, copy
//! them, then commit the rewritten workload guarded by the version it was
//! read at. A version conflict starts over from a fresh fetch.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::adapters::credentials::CredentialProvider;
use crate::adapters::registry::RegistryMirror;
use crate::adapters::store::{Snapshot, UpdateResult, WorkloadStore};
use crate::config::Config;
use crate::image::MirrorNaming;
use crate::metrics::prometheus::{IMAGES_MIRRORED, VERSION_CONFLICTS};
use crate::workload::{Container, Workload};
use crate::{Error, Result};

/// Workload annotation mapping container names to the images they ran before mirroring
pub const ORIGINAL_IMAGES_ANNOTATION: &str = "image-clone-controller/original-images";

/// Workload annotation holding the time of the last image rewrite
pub const MIRRORED_AT_ANNOTATION: &str = "image-clone-controller/mirrored-at";

/// Decides which namespaces are eligible for mutation
#[derive(Debug, Clone, Default)]
pub struct AdmissionFilter {
    excluded: BTreeSet<String>,
}

impl AdmissionFilter {
    pub fn new<I, S>(excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded: excluded.into_iter().map(Into::into).collect(),
        }
    }

    pub fn admit(&self, namespace: &str) -> bool {
        !self.excluded.contains(namespace)
    }
}

/// An image that must be copied to the mirror before its container can be rewritten
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRewrite {
    pub container: String,
    pub source: String,
    pub destination: String,
}

/// Result of planning a rewrite of a container list
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Plan {
    /// Containers in their original order with mirror images substituted
    pub rewritten: Vec<Container>,
    /// Images still to be copied, in container order
    pub pending: Vec<PendingRewrite>,
    /// Names of containers already running a mirrored image
    pub already_mirrored: Vec<String>,
}

impl Plan {
    /// Whether any container needs rewriting
    pub fn changed(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Classify every container and compute its mirror image; performs no I/O
pub fn plan(naming: &MirrorNaming, containers: &[Container]) -> Plan {
    let mut plan = Plan::default();

    for container in containers {
        if container.image.is_empty() {
            plan.rewritten.push(container.clone());
            continue;
        }

        if naming.is_mirrored(&container.image) {
            plan.already_mirrored.push(container.name.clone());
            plan.rewritten.push(container.clone());
            continue;
        }

        let destination = naming.mirror(&container.image);
        plan.pending.push(PendingRewrite {
            container: container.name.clone(),
            source: container.image.clone(),
            destination: destination.clone(),
        });
        plan.rewritten
            .push(Container::new(container.name.clone(), destination));
    }

    plan
}

/// Result of submitting a rewritten workload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Another writer got there first; plan again from a fresh fetch
    ConflictRetry,
    /// The workload disappeared between fetch and commit
    Deleted,
}

/// Apply the plan to the snapshot and write it back under the snapshot's version
pub async fn commit<S: WorkloadStore>(
    store: &S,
    snapshot: Snapshot<S::Kind>,
    plan: &Plan,
) -> Result<CommitOutcome> {
    let Snapshot {
        mut workload,
        version,
    } = snapshot;

    workload.set_containers(&plan.rewritten);
    record_originals(&mut workload, plan);

    Ok(match store.update(&workload, &version).await? {
        UpdateResult::Committed => CommitOutcome::Committed,
        UpdateResult::Conflict => CommitOutcome::ConflictRetry,
        UpdateResult::NotFound => CommitOutcome::Deleted,
    })
}

fn record_originals<K: Workload>(workload: &mut K, plan: &Plan) {
    let annotations = workload.annotations_mut();

    let mut originals: BTreeMap<String, String> = annotations
        .get(ORIGINAL_IMAGES_ANNOTATION)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    for rewrite in &plan.pending {
        originals.insert(rewrite.container.clone(), rewrite.source.clone());
    }

    if let Ok(raw) = serde_json::to_string(&originals) {
        annotations.insert(ORIGINAL_IMAGES_ANNOTATION.to_string(), raw);
    }
    annotations.insert(MIRRORED_AT_ANNOTATION.to_string(), Utc::now().to_rfc3339());
}

/// How a reconciliation ended without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The namespace is excluded; nothing was fetched
    Skipped,
    /// The workload does not exist
    NotFound,
    /// Every image is already mirrored
    UpToDate,
    /// The rewritten workload was written back
    Committed { rewritten: usize },
    /// The workload was deleted before the rewrite could be written
    Deleted,
    /// Conflicts persisted past the local retry budget
    Requeue,
}

/// The reconciliation algorithm with its collaborators injected
pub struct ImageCloner {
    admission: AdmissionFilter,
    naming: MirrorNaming,
    credentials: Arc<dyn CredentialProvider>,
    registry: Arc<dyn RegistryMirror>,
    max_conflict_retries: u32,
    shutdown: CancellationToken,
}

impl ImageCloner {
    pub fn new(
        admission: AdmissionFilter,
        naming: MirrorNaming,
        credentials: Arc<dyn CredentialProvider>,
        registry: Arc<dyn RegistryMirror>,
    ) -> Self {
        Self {
            admission,
            naming,
            credentials,
            registry,
            max_conflict_retries: 3,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build from process configuration
    pub fn from_config(
        config: &Config,
        credentials: Arc<dyn CredentialProvider>,
        registry: Arc<dyn RegistryMirror>,
        shutdown: CancellationToken,
    ) -> Self {
        Self::new(
            AdmissionFilter::new(config.excluded_namespaces.iter().cloned()),
            MirrorNaming::new(config.mirror_prefix.clone()),
            credentials,
            registry,
        )
        .with_max_conflict_retries(config.max_conflict_retries)
        .with_shutdown(shutdown)
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Reconcile one workload identified by namespace and name
    pub async fn reconcile<S: WorkloadStore>(
        &self,
        store: &S,
        namespace: &str,
        name: &str,
    ) -> Result<Outcome> {
        let kind = <S::Kind as Workload>::KIND;

        if !self.admission.admit(namespace) {
            debug!(kind, namespace, name, "Namespace excluded, skipping");
            return Ok(Outcome::Skipped);
        }

        let result = self.reconcile_admitted(store, kind, namespace, name).await;
        if let Err(e) = &result {
            error!(kind, namespace, name, error = %e, "Reconciliation failed");
        }
        result
    }

    async fn reconcile_admitted<S: WorkloadStore>(
        &self,
        store: &S,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Outcome> {
        // Copies survive conflict retries; a pair is never copied twice per call
        let mut copied = HashSet::new();

        for attempt in 0..=self.max_conflict_retries {
            let Some(snapshot) = self.until_shutdown(store.get(namespace, name)).await? else {
                info!(kind, namespace, name, "Workload not found, nothing to do");
                return Ok(Outcome::NotFound);
            };

            let plan = plan(&self.naming, &snapshot.workload.containers());
            for container in &plan.already_mirrored {
                debug!(kind, namespace, name, container = %container, "Already using mirrored image");
            }

            if !plan.changed() {
                return Ok(Outcome::UpToDate);
            }

            self.mirror_pending(kind, namespace, name, &plan, &mut copied)
                .await?;

            // Never start an update once shutdown has begun
            if self.shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match commit(store, snapshot, &plan).await? {
                CommitOutcome::Committed => {
                    info!(
                        kind,
                        namespace,
                        name,
                        rewritten = plan.pending.len(),
                        "Workload now uses mirrored images"
                    );
                    return Ok(Outcome::Committed {
                        rewritten: plan.pending.len(),
                    });
                }
                CommitOutcome::Deleted => {
                    info!(kind, namespace, name, "Workload deleted before commit");
                    return Ok(Outcome::Deleted);
                }
                CommitOutcome::ConflictRetry => {
                    VERSION_CONFLICTS.with_label_values(&[kind]).inc();
                    info!(
                        kind,
                        namespace,
                        name,
                        attempt,
                        "Workload changed since it was read, retrying from a fresh copy"
                    );
                }
            }
        }

        info!(
            kind,
            namespace,
            name,
            retries = self.max_conflict_retries,
            "Conflict retries exhausted, requeueing"
        );
        Ok(Outcome::Requeue)
    }

    /// Copy every pending image in container order, stopping at the first failure
    async fn mirror_pending(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        plan: &Plan,
        copied: &mut HashSet<(String, String)>,
    ) -> Result<()> {
        for rewrite in &plan.pending {
            let key = (rewrite.source.clone(), rewrite.destination.clone());
            if copied.contains(&key) {
                continue;
            }

            if self.shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }

            info!(
                kind,
                namespace,
                name,
                container = %rewrite.container,
                source = %rewrite.source,
                destination = %rewrite.destination,
                "Exchanging container image"
            );

            let keychain = self
                .until_shutdown(self.credentials.resolve(&rewrite.source))
                .await?;

            let copy = self
                .until_shutdown(self.registry.copy(&rewrite.source, &rewrite.destination, &keychain))
                .await;

            match copy {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    return Err(Error::MirrorCopyError {
                        source_image: rewrite.source.clone(),
                        destination_image: rewrite.destination.clone(),
                        message: e.to_string(),
                    })
                }
            }

            IMAGES_MIRRORED.with_label_values(&[kind]).inc();
            copied.insert(key);
        }
        Ok(())
    }

    /// Run an external call unless shutdown wins first
    async fn until_shutdown<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Error::Cancelled),
            result = call => result,
        }
    }
}
