use std::fmt;

use crate::{Error, Result};

/// Registry assumed when a reference names none
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag assumed when a reference carries neither tag nor digest
pub const DEFAULT_TAG: &str = "latest";

/// Tag or digest part of a reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(String),
}

impl Reference {
    /// Value as used in `/v2/<name>/manifests/<reference>`
    pub fn as_str(&self) -> &str {
        match self {
            Reference::Tag(tag) => tag,
            Reference::Digest(digest) => digest,
        }
    }
}

/// Fully qualified image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub reference: Reference,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(tag) => write!(f, "{}/{}:{}", self.registry, self.repository, tag),
            Reference::Digest(digest) => {
                write!(f, "{}/{}@{}", self.registry, self.repository, digest)
            }
        }
    }
}

impl ImageReference {
    /// Parse `[registry/]repository[:tag|@digest]` with Docker Hub defaults
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(Error::InvalidImageReference(s.to_string()));
        }

        let (name, reference) = match s.split_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(Error::InvalidImageReference(s.to_string()));
                }
                // A tag in front of the digest is ignored, the digest wins
                let name = match name.rfind(':') {
                    Some(colon) if name.rfind('/').map_or(true, |slash| colon > slash) => {
                        &name[..colon]
                    }
                    _ => name,
                };
                (name, Reference::Digest(digest.to_string()))
            }
            None => match s.rfind(':') {
                Some(colon) if s.rfind('/').map_or(true, |slash| colon > slash) => {
                    (&s[..colon], Reference::Tag(s[colon + 1..].to_string()))
                }
                _ => (s, Reference::Tag(DEFAULT_TAG.to_string())),
            },
        };

        if reference.as_str().is_empty() {
            return Err(Error::InvalidImageReference(s.to_string()));
        }

        // The first component is a registry host only if it looks like one
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(Error::InvalidImageReference(s.to_string()));
        }

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Host serving the registry API for this reference
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            "registry-1.docker.io"
        } else {
            &self.registry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_docker_hub_name_gets_library_namespace() {
        let reference = ImageReference::parse("nginx:1.21").unwrap();
        assert_eq!(reference.registry, "docker.io");
        assert_eq!(reference.repository, "library/nginx");
        assert_eq!(reference.reference, Reference::Tag("1.21".to_string()));
        assert_eq!(reference.api_host(), "registry-1.docker.io");
    }

    #[test]
    fn missing_tag_defaults_to_latest() {
        let reference = ImageReference::parse("imageclone/nginx").unwrap();
        assert_eq!(reference.repository, "imageclone/nginx");
        assert_eq!(reference.reference, Reference::Tag("latest".to_string()));
    }

    #[test]
    fn registry_with_port_is_recognized() {
        let reference = ImageReference::parse("localhost:5000/team/app:v2").unwrap();
        assert_eq!(reference.registry, "localhost:5000");
        assert_eq!(reference.repository, "team/app");
        assert_eq!(reference.api_host(), "localhost:5000");
        assert_eq!(reference.to_string(), "localhost:5000/team/app:v2");
    }

    #[test]
    fn digest_wins_over_tag() {
        let reference = ImageReference::parse("quay.io/org/app:1.0@sha256:0123").unwrap();
        assert_eq!(reference.registry, "quay.io");
        assert_eq!(reference.repository, "org/app");
        assert_eq!(
            reference.reference,
            Reference::Digest("sha256:0123".to_string())
        );
    }

    #[test]
    fn malformed_references_are_rejected() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("nginx:").is_err());
        assert!(ImageReference::parse("nginx@latest").is_err());
        assert!(ImageReference::parse("quay.io//app").is_err());
        assert!(ImageReference::parse("my image").is_err());
    }
}
