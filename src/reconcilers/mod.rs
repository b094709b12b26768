//! Reconciliation logic for rewriting workload images

pub mod image_clone;
