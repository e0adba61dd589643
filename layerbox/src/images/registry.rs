//! Docker Registry HTTP API v2 client.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::manifest::{LayerDescriptor, Manifest, layers_marker};
use super::{ImageRef, Registry, archive};
use crate::constants::{layout, media_types};
use crate::errors::RegistryError;
use crate::options::{Platform, RegistryOptions};

/// Pulls base images from a Docker Registry HTTP API v2 server.
#[derive(Clone, Debug)]
pub struct DockerRegistry {
    api_base_url: String,
    auth_base_url: String,
    auth_service: String,
    ttl: Option<Duration>,
    request_timeout: Duration,
    platform: Platform,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl DockerRegistry {
    pub fn new(options: &RegistryOptions) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout())
            .build()
            .map_err(|source| RegistryError::Http {
                url: options.api_base_url.clone(),
                source,
            })?;

        Ok(Self {
            api_base_url: options.api_base_url.trim_end_matches('/').to_string(),
            auth_base_url: options.auth_base_url.trim_end_matches('/').to_string(),
            auth_service: options.auth_service.clone(),
            ttl: options.ttl(),
            request_timeout: options.request_timeout(),
            platform: options.platform.clone().unwrap_or_else(Platform::host),
            client,
        })
    }

    /// Registry with Docker Hub endpoints and default policy.
    pub fn docker_hub() -> Result<Self, RegistryError> {
        Self::new(&RegistryOptions::default())
    }

    /// Anonymous bearer token with pull scope on `repository`.
    pub async fn authenticate(&self, repository: &str) -> Result<String, RegistryError> {
        let url = format!(
            "{}/token?scope=repository:{}:pull&service={}",
            self.auth_base_url, repository, self.auth_service
        );
        let body = self.get_text(&url, None, None).await?;
        let response: TokenResponse = serde_json::from_str(&body)
            .map_err(|source| RegistryError::Json { url, source })?;

        response
            .token
            .or(response.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::MissingToken(repository.to_string()))
    }

    /// Layer list of `image` for the configured platform.
    ///
    /// Manifest lists and OCI indexes are resolved to the matching platform
    /// entry, which is then fetched by digest.
    pub async fn resolve_layers(
        &self,
        image: &ImageRef,
        token: &str,
    ) -> Result<Vec<LayerDescriptor>, RegistryError> {
        let manifest = self
            .fetch_manifest(&image.repository, &image.reference, token)
            .await?;

        let manifest = if manifest.is_index() {
            let entry = manifest.select_platform(&self.platform)?;
            debug!(
                platform = %self.platform,
                digest = %entry.digest,
                "Selected platform manifest"
            );
            self.fetch_manifest(&image.repository, &entry.digest, token)
                .await?
        } else {
            manifest
        };

        if manifest.layers.is_empty() {
            return Err(RegistryError::EmptyManifest(image.to_string()));
        }
        Ok(manifest.layers)
    }

    /// Download a blob into a temporary file next to `dir`, verifying its digest.
    pub async fn download(
        &self,
        repository: &str,
        layer: &LayerDescriptor,
        token: &str,
        scratch: &Path,
    ) -> Result<tempfile::NamedTempFile, RegistryError> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.api_base_url, repository, layer.digest
        );
        let response = self.get(&url, Some(token), None).await?;

        let tmp = tempfile::Builder::new()
            .prefix(".blob-")
            .tempfile_in(scratch)
            .map_err(|e| RegistryError::io(scratch, e))?;
        let std_file = tmp.reopen().map_err(|e| RegistryError::io(tmp.path(), e))?;
        let mut file = tokio::fs::File::from_std(std_file);

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| self.http_error(&url, source))?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| RegistryError::io(tmp.path(), e))?;
        }
        file.flush()
            .await
            .map_err(|e| RegistryError::io(tmp.path(), e))?;

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = layer.digest.strip_prefix("sha256:")
            && expected != actual
        {
            return Err(RegistryError::DigestMismatch {
                digest: layer.digest.clone(),
                actual,
            });
        }

        debug!(digest = %layer.digest, size, "Downloaded blob");
        Ok(tmp)
    }

    async fn fetch_manifest(
        &self,
        repository: &str,
        reference: &str,
        token: &str,
    ) -> Result<Manifest, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.api_base_url, repository, reference
        );
        let accept = [
            media_types::DOCKER_MANIFEST_V2,
            media_types::DOCKER_MANIFEST_LIST,
            media_types::OCI_MANIFEST,
            media_types::OCI_INDEX,
        ]
        .join(", ");

        let body = self.get_text(&url, Some(token), Some(&accept)).await?;
        let manifest: Manifest = serde_json::from_str(&body)
            .map_err(|source| RegistryError::Json { url, source })?;
        debug!(
            reference = %reference,
            media_type = ?manifest.media_type,
            layers = manifest.layers.len(),
            manifests = manifest.manifests.len(),
            "Fetched manifest"
        );
        Ok(manifest)
    }

    async fn get(
        &self,
        url: &str,
        token: Option<&str>,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, RegistryError> {
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }

        let response = request
            .send()
            .await
            .map_err(|source| self.http_error(url, source))?;
        let status = response.status();
        if status.as_u16() >= 300 {
            return Err(RegistryError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn get_text(
        &self,
        url: &str,
        token: Option<&str>,
        accept: Option<&str>,
    ) -> Result<String, RegistryError> {
        self.get(url, token, accept)
            .await?
            .text()
            .await
            .map_err(|source| self.http_error(url, source))
    }

    fn http_error(&self, url: &str, source: reqwest::Error) -> RegistryError {
        if source.is_timeout() {
            RegistryError::Timeout {
                url: url.to_string(),
                secs: self.request_timeout.as_secs(),
            }
        } else {
            RegistryError::Http {
                url: url.to_string(),
                source,
            }
        }
    }

    /// Whether the marker is recent enough to skip the registry.
    fn is_fresh(&self, marker: &Path) -> bool {
        let Ok(metadata) = std::fs::metadata(marker) else {
            return false;
        };
        let Some(ttl) = self.ttl else {
            return true;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .unwrap_or(Duration::ZERO);
        age < ttl
    }
}

#[async_trait]
impl Registry for DockerRegistry {
    async fn pull(&self, image: &str, dir: &Path) -> Result<bool, RegistryError> {
        let image_ref = ImageRef::parse(image)?;
        let marker = dir.join(layout::LAYER_INFO_FILE);

        if self.is_fresh(&marker) {
            debug!(image = %image_ref, "Base image is fresh, skipping registry");
            return Ok(false);
        }

        let token = self.authenticate(&image_ref.repository).await?;
        let layers = self.resolve_layers(&image_ref, &token).await?;
        let wanted = layers_marker(&layers);

        if let Ok(stored) = tokio::fs::read_to_string(&marker).await
            && stored == wanted
        {
            debug!(image = %image_ref, "Base image unchanged upstream");
            touch(&marker)?;
            return Ok(false);
        }

        info!(image = %image_ref, layers = layers.len(), "Pulling base image");

        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(RegistryError::io(dir, e)),
        }
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| RegistryError::io(dir, e))?;
        let scratch = scratch_dir(dir);

        for (i, layer) in layers.iter().enumerate() {
            debug!(
                digest = %layer.digest,
                "Layer {}/{}",
                i + 1,
                layers.len()
            );
            let blob = self
                .download(&image_ref.repository, layer, &token, &scratch)
                .await?;
            let dest = dir.to_path_buf();
            tokio::task::spawn_blocking(move || archive::extract_blob(blob.path(), &dest))
                .await
                .map_err(|e| RegistryError::Archive {
                    path: dir.to_path_buf(),
                    source: std::io::Error::other(e),
                })??;
        }

        tokio::fs::write(&marker, wanted)
            .await
            .map_err(|e| RegistryError::io(&marker, e))?;
        info!(image = %image_ref, "Pulled base image");
        Ok(true)
    }
}

/// Blobs are staged next to the layer dir so extraction stays on one filesystem.
fn scratch_dir(dir: &Path) -> PathBuf {
    dir.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn touch(path: &Path) -> Result<(), RegistryError> {
    filetime::set_file_mtime(path, filetime::FileTime::now()).map_err(|e| RegistryError::io(path, e))
}
