//! Controller implementations for watching and reconciling workloads

pub mod workload_controller;

use kube::Client;
use std::sync::Arc;

use crate::reconcilers::image_clone::ImageCloner;

/// Shared context for controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Reconciliation algorithm shared by every watched kind
    pub cloner: ImageCloner,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, cloner: ImageCloner) -> Arc<Self> {
        Arc::new(Self { client, cloner })
    }
}
