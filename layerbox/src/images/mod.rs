mod archive;
mod manifest;
mod registry;

pub use archive::{apply_layer, extract_blob};
pub use manifest::LayerDescriptor;
pub use registry::DockerRegistry;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;

use crate::constants::registry::{DEFAULT_TAG, OFFICIAL_NAMESPACE};
use crate::errors::RegistryError;

// ============================================================================
// Registry
// ============================================================================

/// Source of base images.
///
/// `pull` materializes `image` into `dir` and reports whether the content of
/// `dir` changed. Implementations must leave `dir` untouched when they
/// return `Ok(false)`.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn pull(&self, image: &str, dir: &Path) -> Result<bool, RegistryError>;
}

// ============================================================================
// Image References
// ============================================================================

/// A parsed `repository[:tag][@digest]` reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    /// Repository path, with `library/` prepended for official images.
    pub repository: String,
    /// Tag or digest to resolve.
    pub reference: String,
}

impl ImageRef {
    /// Parse an image reference.
    ///
    /// `alpine` becomes `library/alpine:latest`; `user/app:v1` keeps its
    /// namespace; `app@sha256:...` resolves by digest.
    pub fn parse(image: &str) -> Result<Self, RegistryError> {
        let image = image.trim();
        let (name, reference) = match image.split_once('@') {
            Some((name, digest)) => (name, digest.to_string()),
            None => match image.rsplit_once(':') {
                // A colon before the last slash is a registry port, not a tag.
                Some((name, tag)) if !tag.contains('/') => (name, tag.to_string()),
                _ => (image, DEFAULT_TAG.to_string()),
            },
        };

        if name.is_empty() || reference.is_empty() {
            return Err(RegistryError::InvalidReference(image.to_string()));
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            format!("{OFFICIAL_NAMESPACE}/{name}")
        };
        Ok(Self {
            repository,
            reference,
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reference.contains(':') {
            write!(f, "{}@{}", self.repository, self.reference)
        } else {
            write!(f, "{}:{}", self.repository, self.reference)
        }
    }
}
