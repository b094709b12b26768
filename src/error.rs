//! Error types for the Image Clone Controller

/// Result type for the controller
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the controller
///
/// Deleted workloads and admission rejections are not errors; they are
/// reported as [`crate::reconcilers::image_clone::Outcome`] values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fetching the workload from the API server failed
    #[error("Failed to fetch {kind} {namespace}/{name}: {message}")]
    StoreFetchError {
        kind: String,
        namespace: String,
        name: String,
        message: String,
    },

    /// Writing the rewritten workload back failed for a reason other than a conflict
    #[error("Failed to update {kind} {namespace}/{name}: {message}")]
    StoreUpdateError {
        kind: String,
        namespace: String,
        name: String,
        message: String,
    },

    /// Pull credentials could not be resolved for an image
    #[error("Failed to resolve credentials for {image}: {message}")]
    CredentialError { image: String, message: String },

    /// Copying an image into the mirror failed
    #[error("Failed to mirror {source_image} to {destination_image}: {message}")]
    MirrorCopyError {
        source_image: String,
        destination_image: String,
        message: String,
    },

    /// OCI distribution API error
    #[error("Registry error: {0}")]
    RegistryError(String),

    /// Secret error
    #[error("Secret error: {0}")]
    SecretError(String),

    /// Image reference could not be parsed
    #[error("Invalid image reference: {0}")]
    InvalidImageReference(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(String),

    /// Reconciliation aborted by shutdown
    #[error("Reconciliation cancelled")]
    Cancelled,
}

