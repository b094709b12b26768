//! OCI distribution client that copies images between registries
//!
//! A copy pulls the source manifest, transfers every blob the destination
//! does not already have, then pushes the manifest unchanged so the mirrored
//! image keeps its digest. Multi-platform indexes are copied child by child.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::adapters::credentials::{Keychain, RegistryAuth};
use crate::image::ImageReference;
use crate::{Error, Result};

pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

const ACCEPTED_MANIFESTS: [&str; 4] = [OCI_INDEX, OCI_MANIFEST, DOCKER_MANIFEST_LIST, DOCKER_MANIFEST];

/// Copies an image from its source location to its mirror location
#[async_trait]
pub trait RegistryMirror: Send + Sync {
    async fn copy(&self, source: &str, destination: &str, keychain: &Keychain) -> Result<()>;
}

/// [`RegistryMirror`] speaking the OCI distribution HTTP API
pub struct OciRegistryClient {
    http: Client,
    insecure_registries: BTreeSet<String>,
}

impl OciRegistryClient {
    pub fn new(timeout: Duration, insecure_registries: Vec<String>) -> Result<Self> {
        info!("Initializing OCI registry HTTP client");
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("image-clone-controller/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::RegistryError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            insecure_registries: insecure_registries.into_iter().collect(),
        })
    }

    fn session<'a>(
        &'a self,
        image: &ImageReference,
        keychain: &Keychain,
        actions: &'static str,
    ) -> Session<'a> {
        let host = image.api_host();
        let scheme = if self.insecure_registries.contains(host)
            || self.insecure_registries.contains(&image.registry)
        {
            "http"
        } else {
            "https"
        };

        Session {
            http: &self.http,
            base: format!("{}://{}", scheme, host),
            repository: image.repository.clone(),
            actions,
            credentials: keychain.auth_for(&image.registry),
            authorization: None,
        }
    }
}

#[async_trait]
impl RegistryMirror for OciRegistryClient {
    async fn copy(&self, source: &str, destination: &str, keychain: &Keychain) -> Result<()> {
        let source_ref = ImageReference::parse(source)?;
        let destination_ref = ImageReference::parse(destination)?;

        let mut from = self.session(&source_ref, keychain, "pull");
        let mut to = self.session(&destination_ref, keychain, "pull,push");

        let manifest = from.get_manifest(source_ref.reference.as_str()).await?;

        if manifest.is_index() {
            for child in &manifest.parsed.manifests {
                let child_manifest = from.get_manifest(&child.digest).await?;
                if child_manifest.is_index() {
                    return Err(Error::RegistryError(format!(
                        "Nested index {} in {} is not supported",
                        child.digest, source
                    )));
                }
                copy_blobs(&mut from, &mut to, &child_manifest).await?;
                to.put_manifest(&child.digest, &child_manifest).await?;
            }
        } else {
            copy_blobs(&mut from, &mut to, &manifest).await?;
        }

        to.put_manifest(destination_ref.reference.as_str(), &manifest)
            .await?;

        info!(source, destination, media_type = %manifest.media_type, "Copied image");
        Ok(())
    }
}

async fn copy_blobs(from: &mut Session<'_>, to: &mut Session<'_>, manifest: &Manifest) -> Result<()> {
    for blob in manifest.parsed.config.iter().chain(&manifest.parsed.layers) {
        if to.blob_exists(&blob.digest).await? {
            debug!(digest = %blob.digest, "Blob already present in destination");
            continue;
        }

        let data = from.get_blob(&blob.digest).await?;
        to.upload_blob(&blob.digest, data).await?;
        debug!(digest = %blob.digest, size = blob.size, "Uploaded blob");
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct ManifestBody {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
    #[serde(default)]
    size: u64,
}

struct Manifest {
    media_type: String,
    body: Vec<u8>,
    parsed: ManifestBody,
}

impl Manifest {
    fn is_index(&self) -> bool {
        self.media_type == OCI_INDEX
            || self.media_type == DOCKER_MANIFEST_LIST
            || (!self.parsed.manifests.is_empty() && self.parsed.config.is_none())
    }
}

enum Authorization {
    Bearer(String),
    Basic,
}

/// Access to one repository, caching the negotiated authorization
struct Session<'a> {
    http: &'a Client,
    base: String,
    repository: String,
    actions: &'static str,
    credentials: RegistryAuth,
    authorization: Option<Authorization>,
}

impl Session<'_> {
    fn url(&self, path: &str) -> String {
        format!("{}/v2/{}/{}", self.base, self.repository, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match (&self.authorization, &self.credentials) {
            (Some(Authorization::Bearer(token)), _) => request.bearer_auth(token),
            (Some(Authorization::Basic), RegistryAuth::Basic { username, password }) => {
                request.basic_auth(username, Some(password.expose_secret()))
            }
            _ => request,
        }
    }

    /// Send a request, answering one authentication challenge if the registry asks
    async fn send<F>(&mut self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let response = self
            .authorize(build(self.http))
            .send()
            .await
            .map_err(request_error)?;

        if response.status() != StatusCode::UNAUTHORIZED || self.authorization.is_some() {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::RegistryError(format!(
                    "{} answered 401 without an authentication challenge",
                    self.base
                ))
            })?;

        self.negotiate(&challenge).await?;

        self.authorize(build(self.http))
            .send()
            .await
            .map_err(request_error)
    }

    async fn negotiate(&mut self, challenge: &str) -> Result<()> {
        let (scheme, params) = parse_challenge(challenge);

        if scheme.eq_ignore_ascii_case("basic") {
            if matches!(self.credentials, RegistryAuth::Anonymous) {
                return Err(Error::RegistryError(format!(
                    "{} requires credentials but none are configured",
                    self.base
                )));
            }
            self.authorization = Some(Authorization::Basic);
            return Ok(());
        }

        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(Error::RegistryError(format!(
                "Unsupported authentication scheme '{}' from {}",
                scheme, self.base
            )));
        }

        let realm = params.get("realm").ok_or_else(|| {
            Error::RegistryError(format!("Bearer challenge from {} has no realm", self.base))
        })?;
        let scope = format!("repository:{}:{}", self.repository, self.actions);

        let mut query = vec![("scope", scope.as_str())];
        if let Some(service) = params.get("service") {
            query.push(("service", service.as_str()));
        }

        let mut request = self.http.get(realm).query(&query);
        if let RegistryAuth::Basic { username, password } = &self.credentials {
            request = request.basic_auth(username, Some(password.expose_secret()));
        }

        let response = check(request.send().await.map_err(request_error)?, "token request").await?;

        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::RegistryError(format!("Invalid token response: {}", e)))?;
        let token = body.token.or(body.access_token).ok_or_else(|| {
            Error::RegistryError(format!("Token response from {} has no token", realm))
        })?;

        self.authorization = Some(Authorization::Bearer(token));
        Ok(())
    }

    async fn get_manifest(&mut self, reference: &str) -> Result<Manifest> {
        let url = self.url(&format!("manifests/{}", reference));
        let accept = ACCEPTED_MANIFESTS.join(", ");
        let response = self
            .send(|http| http.get(&url).header(ACCEPT, accept.as_str()))
            .await?;
        let response = check(response, &format!("GET {}", url)).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let body = response.bytes().await.map_err(request_error)?.to_vec();
        let parsed: ManifestBody = serde_json::from_slice(&body)
            .map_err(|e| Error::RegistryError(format!("Invalid manifest at {}: {}", url, e)))?;

        let media_type = content_type
            .filter(|ct| ACCEPTED_MANIFESTS.contains(&ct.as_str()))
            .or_else(|| parsed.media_type.clone())
            .unwrap_or_else(|| OCI_MANIFEST.to_string());

        Ok(Manifest {
            media_type,
            body,
            parsed,
        })
    }

    async fn put_manifest(&mut self, reference: &str, manifest: &Manifest) -> Result<()> {
        let url = self.url(&format!("manifests/{}", reference));
        let response = self
            .send(|http| {
                http.put(&url)
                    .header(CONTENT_TYPE, manifest.media_type.as_str())
                    .body(manifest.body.clone())
            })
            .await?;
        check(response, &format!("PUT {}", url)).await?;
        Ok(())
    }

    async fn blob_exists(&mut self, digest: &str) -> Result<bool> {
        let url = self.url(&format!("blobs/{}", digest));
        let response = self.send(|http| http.head(&url)).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(Error::RegistryError(format!(
                "HEAD {} returned {}",
                url, status
            ))),
        }
    }

    async fn get_blob(&mut self, digest: &str) -> Result<Vec<u8>> {
        let url = self.url(&format!("blobs/{}", digest));
        let response = self.send(|http| http.get(&url)).await?;
        let response = check(response, &format!("GET {}", url)).await?;
        let data = response.bytes().await.map_err(request_error)?.to_vec();
        verify_digest(digest, &data)?;
        Ok(data)
    }

    async fn upload_blob(&mut self, digest: &str, data: Vec<u8>) -> Result<()> {
        let start_url = self.url("blobs/uploads/");
        let response = self.send(|http| http.post(&start_url)).await?;
        let response = check(response, &format!("POST {}", start_url)).await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                Error::RegistryError(format!("POST {} returned no upload location", start_url))
            })?;
        let upload_url = if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}{}", self.base, location)
        };

        let response = self
            .send(|http| {
                http.put(&upload_url)
                    .query(&[("digest", digest)])
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(data.clone())
            })
            .await?;
        check(response, &format!("PUT {}", upload_url)).await?;
        Ok(())
    }
}

fn request_error(e: reqwest::Error) -> Error {
    Error::RegistryError(format!("Request failed: {}", e))
}

async fn check(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(256).collect();
    Err(Error::RegistryError(format!(
        "{} returned {}: {}",
        what, status, body
    )))
}

/// Check downloaded content against its `sha256:` digest; other algorithms are trusted
pub fn verify_digest(digest: &str, data: &[u8]) -> Result<()> {
    let Some(expected) = digest.strip_prefix("sha256:") else {
        return Ok(());
    };

    let actual = format!("{:x}", Sha256::digest(data));
    if actual != expected {
        return Err(Error::RegistryError(format!(
            "Digest mismatch: expected {}, got sha256:{}",
            digest, actual
        )));
    }
    Ok(())
}

/// Split a `WWW-Authenticate` value into its scheme and parameters
pub fn parse_challenge(header: &str) -> (String, BTreeMap<String, String>) {
    let header = header.trim();
    let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));

    let mut params = BTreeMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }

        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                value.push(c);
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }

        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    (scheme.to_string(), params)
}
