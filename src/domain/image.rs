//! Container image references

use crate::error::{Error, Result};

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// A parsed `[registry/]repository[:tag][@digest]` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(image: &str) -> Result<Self> {
        if image.is_empty() || image.chars().any(char::is_whitespace) {
            return Err(Error::InvalidImageReference(image.to_string()));
        }

        let (name, digest) = match image.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (image, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a registry port
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => (
                &name[..last_slash + i],
                Some(name[last_slash + i + 1..].to_string()),
            ),
            None => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
        };

        if repository.is_empty() || tag.as_deref() == Some("") {
            return Err(Error::InvalidImageReference(image.to_string()));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Tag or digest used to address the manifest
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or("latest")
    }
}

/// Image a build pushes to when a signing stage follows it.
///
/// The tag of the final image is extended so that unsigned artifacts of
/// different modules never collide in a shared repository.
pub fn intermediate_image_name(image: &str, namespace: &str, module: &str) -> String {
    let without_digest = image.split('@').next().unwrap_or(image);
    let last_slash = without_digest.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (repository, tag) = match without_digest[last_slash..].rfind(':') {
        Some(i) => (
            &without_digest[..last_slash + i],
            &without_digest[last_slash + i + 1..],
        ),
        None => (without_digest, "latest"),
    };
    format!("{}:{}_{}_{}_kmm_unsigned", repository, tag, namespace, module)
}
