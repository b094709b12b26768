//! Workload kinds the controller rewrites
//!
//! The reconciliation algorithm is written once against [`Workload`]; each
//! watched kind only has to expose its pod template.

use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::PodSpec;
use kube::core::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A container's name and image as seen by the planner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    /// Empty when the container declares no image
    pub image: String,
}

impl Container {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
        }
    }
}

/// A namespaced object carrying a pod template whose images can be rewritten
pub trait Workload:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    /// Kind name used in logs and metric labels
    const KIND: &'static str;

    /// Pod spec of the template, if the object has one
    fn pod_spec(&self) -> Option<&PodSpec>;

    /// Mutable pod spec of the template, if the object has one
    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec>;

    /// Containers of the pod template in declaration order
    fn containers(&self) -> Vec<Container> {
        self.pod_spec()
            .map(|spec| {
                spec.containers
                    .iter()
                    .map(|c| Container::new(c.name.clone(), c.image.clone().unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Write back images position by position; entries with an empty image are skipped
    fn set_containers(&mut self, containers: &[Container]) {
        if let Some(spec) = self.pod_spec_mut() {
            for (current, desired) in spec.containers.iter_mut().zip(containers) {
                if !desired.image.is_empty() {
                    current.image = Some(desired.image.clone());
                }
            }
        }
    }
}

impl Workload for Deployment {
    const KIND: &'static str = "Deployment";

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()?.template.spec.as_ref()
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut()?.template.spec.as_mut()
    }
}

impl Workload for DaemonSet {
    const KIND: &'static str = "DaemonSet";

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()?.template.spec.as_ref()
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut()?.template.spec.as_mut()
    }
}
