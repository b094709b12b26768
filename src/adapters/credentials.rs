//! Registry credentials from image pull secrets
//!
//! The pull secrets are read on every call so that rotated credentials are
//! picked up without restarting the controller.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::adapters::secrets;
use crate::image::ImageReference;
use crate::secret_string::SecretString;
use crate::{Error, Result};

const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKER_CFG_KEY: &str = ".dockercfg";

/// Credentials for a single registry
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegistryAuth {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: SecretString,
    },
}

/// Credentials keyed by normalized registry host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keychain {
    entries: BTreeMap<String, RegistryAuth>,
}

impl Keychain {
    /// Add credentials for `registry`; the first entry for a host wins
    pub fn insert(&mut self, registry: &str, auth: RegistryAuth) {
        self.entries
            .entry(normalize_registry(registry))
            .or_insert(auth);
    }

    /// Credentials for `registry`, anonymous if none are known
    pub fn auth_for(&self, registry: &str) -> RegistryAuth {
        self.entries
            .get(&normalize_registry(registry))
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, registry: &str) -> bool {
        self.entries.contains_key(&normalize_registry(registry))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn merge(&mut self, other: Keychain) {
        for (registry, auth) in other.entries {
            self.entries.entry(registry).or_insert(auth);
        }
    }
}

/// Resolves the credentials used to pull an image and push its mirror
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, image: &str) -> Result<Keychain>;
}

/// [`CredentialProvider`] reading dockerconfigjson pull secrets from one namespace
pub struct PullSecretCredentialProvider {
    client: Client,
    namespace: String,
    secret_names: Vec<String>,
}

impl PullSecretCredentialProvider {
    pub fn new(client: Client, namespace: impl Into<String>, secret_names: Vec<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            secret_names,
        }
    }
}

#[async_trait]
impl CredentialProvider for PullSecretCredentialProvider {
    async fn resolve(&self, image: &str) -> Result<Keychain> {
        let credential_error = |message: String| Error::CredentialError {
            image: image.to_string(),
            message,
        };

        let mut keychain = Keychain::default();
        for name in &self.secret_names {
            let secret = secrets::get_secret(&self.client, &self.namespace, name)
                .await
                .map_err(|e| credential_error(e.to_string()))?;

            match secret {
                Some(secret) => {
                    let parsed = keychain_from_secret(&secret).map_err(|e| {
                        credential_error(format!("pull secret {}/{}: {}", self.namespace, name, e))
                    })?;
                    keychain.merge(parsed);
                }
                None => warn!(
                    namespace = %self.namespace,
                    secret = %name,
                    "Pull secret not found, continuing without it"
                ),
            }
        }

        let registry = ImageReference::parse(image)?.registry;
        if !keychain.contains(&registry) {
            debug!(image, registry = %registry, "No pull secret entry, using anonymous access");
        }

        Ok(keychain)
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfigJson {
    #[serde(default)]
    auths: BTreeMap<String, DockerConfigEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Build a keychain from a `kubernetes.io/dockerconfigjson` or legacy `kubernetes.io/dockercfg` secret
pub fn keychain_from_secret(secret: &Secret) -> Result<Keychain> {
    if secrets::has_key(secret, DOCKER_CONFIG_JSON_KEY) {
        let raw = secrets::get_secret_key(secret, DOCKER_CONFIG_JSON_KEY)?;
        let config: DockerConfigJson = serde_json::from_str(&raw)
            .map_err(|e| Error::SecretError(format!("Invalid {}: {}", DOCKER_CONFIG_JSON_KEY, e)))?;
        return keychain_from_entries(config.auths);
    }

    if secrets::has_key(secret, DOCKER_CFG_KEY) {
        let raw = secrets::get_secret_key(secret, DOCKER_CFG_KEY)?;
        let entries: BTreeMap<String, DockerConfigEntry> = serde_json::from_str(&raw)
            .map_err(|e| Error::SecretError(format!("Invalid {}: {}", DOCKER_CFG_KEY, e)))?;
        return keychain_from_entries(entries);
    }

    Err(Error::SecretError(format!(
        "Secret has neither {} nor {}",
        DOCKER_CONFIG_JSON_KEY, DOCKER_CFG_KEY
    )))
}

fn keychain_from_entries(entries: BTreeMap<String, DockerConfigEntry>) -> Result<Keychain> {
    let mut keychain = Keychain::default();
    for (registry, entry) in entries {
        keychain.insert(&registry, auth_from_entry(&registry, entry)?);
    }
    Ok(keychain)
}

fn auth_from_entry(registry: &str, entry: DockerConfigEntry) -> Result<RegistryAuth> {
    if let (Some(username), Some(password)) = (entry.username, entry.password) {
        return Ok(RegistryAuth::Basic {
            username,
            password: SecretString::new(password),
        });
    }

    let Some(encoded) = entry.auth.filter(|a| !a.is_empty()) else {
        return Ok(RegistryAuth::Anonymous);
    };

    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::SecretError(format!("Invalid auth for {}: {}", registry, e)))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| Error::SecretError(format!("Invalid auth for {}: {}", registry, e)))?;

    let (username, password) = decoded.split_once(':').ok_or_else(|| {
        Error::SecretError(format!(
            "Invalid auth for {}: expected user:password",
            registry
        ))
    })?;

    Ok(RegistryAuth::Basic {
        username: username.to_string(),
        password: SecretString::new(password),
    })
}

/// Reduce a docker config key (`https://index.docker.io/v1/`, `quay.io`, ...) to a bare host
pub fn normalize_registry(key: &str) -> String {
    let without_scheme = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_ascii_lowercase();

    match host.as_str() {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
            "docker.io".to_string()
        }
        _ => host,
    }
}
