//! Process configuration
//!
//! Every option can be given as a command line flag or through the
//! environment, which is how the controller Deployment sets them.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::{Error, Result};

/// Default prefix that marks an image as mirrored
pub const DEFAULT_MIRROR_PREFIX: &str = "imageclone";

/// Namespace the controller itself runs in
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "image-clone-controller-system";

/// Pull secret holding the mirror registry credentials
pub const DEFAULT_PULL_SECRET: &str = "image-clone-controller-regcred";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Image Clone Controller configuration
#[derive(Parser, Debug, Clone)]
#[command(
    name = "image-clone-controller",
    version,
    about = "Mirrors Deployment and DaemonSet images into a backup registry",
    long_about = None
)]
pub struct Config {
    /// Repository prefix under which mirrored images are pushed (e.g. imageclone or registry.local/mirror)
    #[arg(long, env = "MIRROR_PREFIX", default_value = DEFAULT_MIRROR_PREFIX)]
    pub mirror_prefix: String,

    /// Namespaces whose workloads are never touched
    #[arg(
        long,
        env = "EXCLUDED_NAMESPACES",
        value_delimiter = ',',
        default_value = "kube-system"
    )]
    pub excluded_namespaces: Vec<String>,

    /// Namespace holding the registry pull secrets
    #[arg(long, env = "CONTROLLER_NAMESPACE", default_value = DEFAULT_CONTROLLER_NAMESPACE)]
    pub controller_namespace: String,

    /// Pull secrets (dockerconfigjson) used for both source and mirror registries
    #[arg(
        long,
        env = "PULL_SECRETS",
        value_delimiter = ',',
        default_value = DEFAULT_PULL_SECRET
    )]
    pub pull_secrets: Vec<String>,

    /// Commit attempts after a version conflict before handing back to the work queue
    #[arg(long, env = "MAX_CONFLICT_RETRIES", default_value_t = 3)]
    pub max_conflict_retries: u32,

    /// Registry hosts reached over plain http
    #[arg(long, env = "INSECURE_REGISTRIES", value_delimiter = ',')]
    pub insecure_registries: Vec<String>,

    /// Timeout for a single registry request in seconds
    #[arg(long, env = "REGISTRY_TIMEOUT_SECS", default_value_t = 300)]
    pub registry_timeout_secs: u64,

    /// Port for the metrics and health endpoints
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mirror_prefix: DEFAULT_MIRROR_PREFIX.to_string(),
            excluded_namespaces: vec!["kube-system".to_string()],
            controller_namespace: DEFAULT_CONTROLLER_NAMESPACE.to_string(),
            pull_secrets: vec![DEFAULT_PULL_SECRET.to_string()],
            max_conflict_retries: 3,
            insecure_registries: Vec::new(),
            registry_timeout_secs: 300,
            metrics_port: 8080,
            log_format: LogFormat::Json,
        }
    }
}

impl Config {
    /// Check option values that clap cannot express
    pub fn validate(&self) -> Result<()> {
        let prefix = &self.mirror_prefix;

        if prefix.is_empty() {
            return Err(Error::ConfigError(
                "mirror prefix cannot be empty".to_string(),
            ));
        }

        if prefix.ends_with('/') || prefix.starts_with('/') {
            return Err(Error::ConfigError(format!(
                "mirror prefix '{}' must not start or end with '/'",
                prefix
            )));
        }

        if prefix.contains('@') || prefix.chars().any(char::is_whitespace) {
            return Err(Error::ConfigError(format!(
                "mirror prefix '{}' must not contain '@' or whitespace",
                prefix
            )));
        }

        if self.controller_namespace.is_empty() {
            return Err(Error::ConfigError(
                "controller namespace cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Timeout applied to every registry request
    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }
}
