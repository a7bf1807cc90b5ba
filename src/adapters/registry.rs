//! OCI registry lookups
//!
//! Answers "does this image exist" with an anonymous manifest `HEAD`
//! against the registry's v2 API. Registry authentication is not handled:
//! a registry that refuses anonymous access reports every image as missing,
//! which only costs a redundant build.

use crate::config::RegistryConfig;
use crate::domain::{ImageReference, ImageRegistry};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use tracing::debug;

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.docker.distribution.manifest.v2+json";

/// Registry adapter backed by `reqwest`
pub struct RegistryClient {
    client: Client,
    insecure: bool,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            insecure: config.insecure,
        })
    }

    /// Manifest URL of an image
    pub fn manifest_url(&self, reference: &ImageReference) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme,
            reference.registry,
            reference.repository,
            reference.reference()
        )
    }
}

#[async_trait]
impl ImageRegistry for RegistryClient {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let reference = ImageReference::parse(image)?;
        let url = self.manifest_url(&reference);

        let response = self
            .client
            .head(&url)
            .header(ACCEPT, MANIFEST_MEDIA_TYPES)
            .send()
            .await?;

        let status = response.status();
        debug!(image, %status, "Registry manifest lookup");
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
            other => Err(Error::RegistryStatus {
                image: image.to_string(),
                status: other.as_u16(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_url() {
        let client = RegistryClient::new(&RegistryConfig::default()).unwrap();
        let reference = ImageReference::parse("quay.io/acme/kmod:5.14.0-1").unwrap();
        assert_eq!(
            client.manifest_url(&reference),
            "https://quay.io/v2/acme/kmod/manifests/5.14.0-1"
        );

        let insecure = RegistryClient::new(&RegistryConfig {
            insecure: true,
            timeout_secs: 1,
        })
        .unwrap();
        let reference = ImageReference::parse("localhost:5000/kmod").unwrap();
        assert_eq!(
            insecure.manifest_url(&reference),
            "http://localhost:5000/v2/kmod/manifests/latest"
        );
    }

    #[tokio::test]
    async fn test_invalid_reference_is_rejected() {
        let client = RegistryClient::new(&RegistryConfig::default()).unwrap();
        assert!(matches!(
            client.image_exists("bad image").await,
            Err(Error::InvalidImageReference(_))
        ));
    }
}
