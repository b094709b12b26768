//! Image Clone Controller
//!
//! Watches Deployments and DaemonSets, copies their container images into a
//! mirror registry and rewrites the workloads to pull from the mirror.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod error;
pub mod image;
pub mod metrics;
pub mod reconcilers;
pub mod secret_string;
pub mod workload;

pub use error::{Error, Result};
