//! Adapters between the reconciliation algorithm and the outside world:
//! the API server, pull secrets, and container registries

pub mod credentials;
pub mod registry;
pub mod secrets;
pub mod store;
