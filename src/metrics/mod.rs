//! Prometheus metrics for the Image Clone Controller
//!
//! This module exposes metrics for monitoring controller health and performance.

pub mod prometheus;

pub use prometheus::*;
