use std::io;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use getset::Getters;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, Os, Platform};
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio_util::io::StreamReader;

use crate::{
    layer::{LayerId, LayerReader, LayerSource},
    utils, DlrootfsError, DlrootfsResult,
};

use super::{Credentials, ImageReference};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The MIME type of Docker Registry v2 manifests.
const DOCKER_MANIFEST_MIME_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// The MIME type of Docker Registry v2 manifest lists.
const DOCKER_MANIFEST_LIST_MIME_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// The MIME type of OCI image manifests.
const OCI_MANIFEST_MIME_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// The MIME type of OCI image indexes.
const OCI_INDEX_MIME_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// The MIME type of layer blobs.
const DOCKER_IMAGE_BLOB_MIME_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// The annotation marking attestation manifests, which carry no filesystem.
const DOCKER_REFERENCE_TYPE_ANNOTATION: &str = "vnd.docker.reference.type";

/// How many times a transient HTTP failure is retried.
const MAX_RETRIES: u32 = 3;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client for Docker's Registry HTTP API v2 that serves the layers of one image.
///
/// Pull tokens are requested anonymously, or with HTTP basic auth when credentials are given.
/// A manifest list is narrowed down to the linux manifest for the host architecture.
///
/// [Docker Registry API]: https://distribution.github.io/distribution/spec/api/#introduction
#[derive(Debug, Getters)]
#[getset(get = "pub with_prefix")]
pub struct DockerRegistry {
    /// The HTTP client, with retries.
    #[getset(skip)]
    client: ClientWithMiddleware,

    /// The image whose layers are served.
    reference: ImageReference,

    /// Credentials forwarded to the token endpoint.
    #[getset(skip)]
    credentials: Option<Credentials>,

    /// Base URL of the registry API.
    registry_url: String,

    /// The token endpoint.
    auth_realm: String,

    /// The service name sent to the token endpoint.
    auth_service: String,
}

/// A pull token issued by the registry's token endpoint.
#[derive(Debug, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct DockerAuthMaterial {
    /// The token used to authenticate requests to the registry.
    token: String,

    /// The same token, under its OAuth2 name.
    #[serde(default)]
    access_token: Option<String>,

    /// Seconds until the token expires.
    #[serde(default)]
    expires_in: Option<u32>,

    /// When the token was issued.
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
}

/// A response from the registry: either the expected body or its error document.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DockerRegistryResponse<T> {
    /// The expected body.
    Ok(T),

    /// The registry's error document.
    Error(DockerRegistryResponseError),
}

/// An error document returned by the registry.
#[derive(Debug, Serialize, Deserialize, Error)]
#[error("docker registry error: {errors}")]
pub struct DockerRegistryResponseError {
    /// The errors returned by the registry.
    errors: serde_json::Value,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DockerRegistry {
    /// Creates a client serving the layers of `reference`.
    ///
    /// Registry and token endpoints come from the environment, see [`utils::get_registry_url`].
    pub fn new(reference: ImageReference, credentials: Option<Credentials>) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_RETRIES);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            reference,
            credentials,
            registry_url: utils::get_registry_url(),
            auth_realm: utils::get_auth_realm(),
            auth_service: utils::get_auth_service(),
        }
    }

    /// Requests a pull token for the image's repository.
    ///
    /// Tokens are short lived, so one is requested for every registry call.
    async fn get_access_token(&self) -> DlrootfsResult<String> {
        let scope = format!("repository:{}:pull", self.reference.get_repository());
        let mut request = self
            .client
            .get(&self.auth_realm)
            .query(&[("service", self.auth_service.as_str()), ("scope", scope.as_str())]);

        if let Some(credentials) = &self.credentials {
            request =
                request.basic_auth(credentials.get_username(), Some(credentials.get_password()));
        }

        let response = request.send().await?;
        let material = response
            .json::<DockerRegistryResponse<DockerAuthMaterial>>()
            .await?;

        match material {
            DockerRegistryResponse::Ok(material) => Ok(material.token),
            DockerRegistryResponse::Error(err) => Err(err.into()),
        }
    }

    /// Fetches the manifest of the image, resolving a manifest list to the host platform.
    pub async fn fetch_manifest(&self) -> DlrootfsResult<ImageManifest> {
        let reference = self.reference.manifest_reference();
        let document: serde_json::Value = self
            .get_json(
                &format!("manifests/{reference}"),
                &[
                    DOCKER_MANIFEST_LIST_MIME_TYPE,
                    OCI_INDEX_MIME_TYPE,
                    DOCKER_MANIFEST_MIME_TYPE,
                    OCI_MANIFEST_MIME_TYPE,
                ],
            )
            .await?;

        if document.get("errors").is_some() {
            let err: DockerRegistryResponseError = serde_json::from_value(document)?;
            return Err(err.into());
        }

        if document.get("manifests").is_none() {
            return Ok(serde_json::from_value(document)?);
        }

        let index: ImageIndex = serde_json::from_value(document)?;
        let descriptor = select_manifest(&index, &Platform::default())?;
        tracing::debug!(
            "selected manifest {} of {}",
            descriptor.digest(),
            self.reference
        );

        self.get_json(
            &format!("manifests/{}", descriptor.digest()),
            &[DOCKER_MANIFEST_MIME_TYPE, OCI_MANIFEST_MIME_TYPE],
        )
        .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        accept: &[&str],
    ) -> DlrootfsResult<T> {
        let token = self.get_access_token().await?;
        let request = self
            .client
            .get(format!(
                "{}/v2/{}/{path}",
                self.registry_url,
                self.reference.get_repository()
            ))
            .bearer_auth(token)
            .header("Accept", accept.join(", "))
            .build()?;

        let response = self.client.execute(request).await?;
        match response.json::<DockerRegistryResponse<T>>().await? {
            DockerRegistryResponse::Ok(value) => Ok(value),
            DockerRegistryResponse::Error(err) => Err(err.into()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Picks the manifest of `index` for `platform`: linux on the same architecture first, then
/// any os on the same architecture. Attestation manifests are never picked.
pub fn select_manifest<'a>(
    index: &'a ImageIndex,
    platform: &Platform,
) -> DlrootfsResult<&'a Descriptor> {
    let is_attestation = |m: &Descriptor| {
        m.annotations()
            .as_ref()
            .is_some_and(|a| a.contains_key(DOCKER_REFERENCE_TYPE_ANNOTATION))
    };

    index
        .manifests()
        .iter()
        .find(|m| {
            m.platform().as_ref().is_some_and(|p| {
                matches!(p.os(), Os::Linux)
                    && p.architecture() == platform.architecture()
                    && !is_attestation(*m)
            })
        })
        .or_else(|| {
            index.manifests().iter().find(|m| {
                m.platform().as_ref().is_some_and(|p| {
                    p.architecture() == platform.architecture() && !is_attestation(*m)
                })
            })
        })
        .ok_or(DlrootfsError::ManifestNotFound)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl LayerSource for DockerRegistry {
    async fn layer_ids(&self) -> DlrootfsResult<Vec<LayerId>> {
        let manifest = self.fetch_manifest().await?;
        let ids = manifest
            .layers()
            .iter()
            .map(|layer| LayerId::new(layer.digest().to_string()))
            .collect::<Vec<_>>();

        tracing::info!("{} has {} layers", self.reference, ids.len());
        Ok(ids)
    }

    async fn fetch_layer(&self, id: &LayerId) -> DlrootfsResult<LayerReader> {
        tracing::info!("fetching layer {id}");

        let token = self.get_access_token().await?;
        let request = self
            .client
            .get(format!(
                "{}/v2/{}/blobs/{id}",
                self.registry_url,
                self.reference.get_repository()
            ))
            .bearer_auth(token)
            .header("Accept", DOCKER_IMAGE_BLOB_MIME_TYPE)
            .build()?;

        let response = self.client.execute(request).await?;
        if !response.status().is_success() {
            let status = response.status();
            return match response.json::<DockerRegistryResponseError>().await {
                Ok(err) => Err(err.into()),
                Err(_) => Err(DlrootfsError::LayerNotFound(format!("{id} ({status})"))),
            };
        }

        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_manifest_prefers_linux_and_skips_attestations() -> anyhow::Result<()> {
        let index = helper::index()?;

        let amd64 = helper::platform("amd64")?;
        let selected = select_manifest(&index, &amd64)?;
        assert_eq!(selected.digest().digest(), "b".repeat(64));

        let arm64 = helper::platform("arm64")?;
        let selected = select_manifest(&index, &arm64)?;
        assert_eq!(selected.digest().digest(), "c".repeat(64));

        let s390x = helper::platform("s390x")?;
        assert!(matches!(
            select_manifest(&index, &s390x),
            Err(DlrootfsError::ManifestNotFound)
        ));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    #[ignore = "makes network requests to Docker registry"]
    async fn test_docker_registry_layers_of_alpine() -> anyhow::Result<()> {
        use tokio::io::AsyncReadExt;

        let registry = DockerRegistry::new("alpine:latest".parse()?, None);
        let ids = registry.layer_ids().await?;
        assert!(!ids.is_empty());
        assert!(ids[0].as_str().starts_with("sha256:"));

        let mut head = [0u8; 2];
        registry.fetch_layer(&ids[0]).await?.read_exact(&mut head).await?;
        assert_eq!(head, [0x1f, 0x8b]);

        Ok(())
    }

    mod helper {
        use super::*;

        pub(super) fn platform(arch: &str) -> anyhow::Result<Platform> {
            let json = serde_json::json!({ "architecture": arch, "os": "linux" });
            Ok(serde_json::from_value(json)?)
        }

        /// An index with an attestation for amd64 listed before the real amd64 manifest, and an
        /// arm64 manifest only available for a non-linux os.
        pub(super) fn index() -> anyhow::Result<ImageIndex> {
            let json = serde_json::json!({
                "schemaVersion": 2,
                "mediaType": DOCKER_MANIFEST_LIST_MIME_TYPE,
                "manifests": [
                    {
                        "mediaType": OCI_MANIFEST_MIME_TYPE,
                        "digest": format!("sha256:{}", "a".repeat(64)),
                        "size": 100,
                        "platform": { "architecture": "amd64", "os": "linux" },
                        "annotations": { DOCKER_REFERENCE_TYPE_ANNOTATION: "attestation-manifest" }
                    },
                    {
                        "mediaType": DOCKER_MANIFEST_MIME_TYPE,
                        "digest": format!("sha256:{}", "b".repeat(64)),
                        "size": 200,
                        "platform": { "architecture": "amd64", "os": "linux" }
                    },
                    {
                        "mediaType": DOCKER_MANIFEST_MIME_TYPE,
                        "digest": format!("sha256:{}", "c".repeat(64)),
                        "size": 300,
                        "platform": { "architecture": "arm64", "os": "freebsd" }
                    }
                ]
            });

            Ok(serde_json::from_value(json)?)
        }
    }
}
