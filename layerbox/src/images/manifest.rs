//! Registry manifest documents.
//!
//! Only the fields needed to resolve a layer list are modelled. Both the
//! Docker v2 and OCI media types share this shape.

use serde::{Deserialize, Serialize};

use crate::errors::RegistryError;
use crate::options::Platform;

/// A blob reference in an image manifest.
///
/// Field order is fixed: the pretty-printed list of these is the base
/// layer's cache marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: String,
}

/// Either an image manifest or a manifest list / image index.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct Manifest {
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub layers: Vec<LayerDescriptor>,
    #[serde(default)]
    pub manifests: Vec<PlatformManifest>,
}

/// An entry of a manifest list.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct PlatformManifest {
    pub digest: String,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub platform: Option<ManifestPlatform>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ManifestPlatform {
    pub os: String,
    pub architecture: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl Manifest {
    pub fn is_index(&self) -> bool {
        !self.manifests.is_empty()
    }

    /// Pick the entry for `platform` from a manifest list.
    pub fn select_platform(&self, platform: &Platform) -> Result<&PlatformManifest, RegistryError> {
        self.manifests
            .iter()
            .find(|m| {
                m.platform.as_ref().is_some_and(|p| {
                    p.os == platform.os && p.architecture == platform.architecture
                })
            })
            .ok_or_else(|| {
                let available = self
                    .manifests
                    .iter()
                    .filter_map(|m| m.platform.as_ref())
                    .map(|p| match &p.variant {
                        Some(v) => format!("{}/{}/{}", p.os, p.architecture, v),
                        None => format!("{}/{}", p.os, p.architecture),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                RegistryError::NoMatchingPlatform {
                    os: platform.os.clone(),
                    arch: platform.architecture.clone(),
                    available,
                }
            })
    }
}

/// Stable serialization of a layer list, used as the base layer marker.
pub(crate) fn layers_marker(layers: &[LayerDescriptor]) -> String {
    // Serializing plain strings cannot fail.
    serde_json::to_string_pretty(layers).unwrap_or_default()
}
