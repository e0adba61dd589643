//! Configuration for layerbox.

use crate::constants::{envs, layout, registry};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Builder Options
// ============================================================================

/// Options for a [`crate::Builder`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuilderOptions {
    /// Root of the content-addressed layer store.
    ///
    /// Default: `$LAYERBOX_HOME/layers`, or `~/.layerbox/layers`
    #[serde(default = "default_layers_dir")]
    pub layers_dir: PathBuf,

    /// Rebuild every layer regardless of cache markers.
    #[serde(default)]
    pub force: bool,

    /// Bind specs (`src[:dst[:ro|rw]]`) applied to every RUN step.
    #[serde(default)]
    pub mounts: Vec<String>,

    /// Registry used to pull base images.
    #[serde(default)]
    pub registry: RegistryOptions,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            layers_dir: default_layers_dir(),
            force: false,
            mounts: Vec::new(),
            registry: RegistryOptions::default(),
        }
    }
}

fn default_layers_dir() -> PathBuf {
    default_home_dir().join(layout::LAYERS_DIR)
}

/// Home directory for layerbox data.
///
/// `LAYERBOX_HOME` wins; otherwise `~/.layerbox`, falling back to the
/// current directory when no home can be determined.
pub fn default_home_dir() -> PathBuf {
    if let Ok(home) = std::env::var(envs::LAYERBOX_HOME) {
        return PathBuf::from(home);
    }
    let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(layout::LAYERBOX_DIR);
    path
}

// ============================================================================
// Registry Options
// ============================================================================

/// Endpoints and freshness policy of a Docker Registry HTTP API v2 server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryOptions {
    /// Registry API base URL.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Token service base URL (`<auth>/token?...`).
    #[serde(default = "default_auth_base_url")]
    pub auth_base_url: String,

    /// `service` parameter sent with token requests.
    #[serde(default = "default_auth_service")]
    pub auth_service: String,

    /// Maximum age of a pulled base image before the registry is asked again.
    ///
    /// - `-1`: never refresh once present
    /// - `0`: always ask the registry
    /// - `n`: refresh when the marker is older than `n` seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,

    /// Bound on every registry request, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Platform to select from multi-platform images. Defaults to the host.
    #[serde(default)]
    pub platform: Option<Platform>,
}

impl RegistryOptions {
    /// Freshness window; `None` means a present image is never refreshed.
    pub fn ttl(&self) -> Option<Duration> {
        u64::try_from(self.ttl_secs).ok().map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            auth_base_url: default_auth_base_url(),
            auth_service: default_auth_service(),
            ttl_secs: default_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            platform: None,
        }
    }
}

fn default_api_base_url() -> String {
    registry::DOCKER_HUB_API.to_string()
}

fn default_auth_base_url() -> String {
    registry::DOCKER_HUB_AUTH.to_string()
}

fn default_auth_service() -> String {
    registry::DOCKER_HUB_SERVICE.to_string()
}

fn default_ttl_secs() -> i64 {
    -1
}

fn default_request_timeout_secs() -> u64 {
    300
}

// ============================================================================
// Platform
// ============================================================================

/// OCI platform (os/architecture) used to pick from a manifest list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Platform {
    /// Platform of the running host, in OCI naming.
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "aarch64" => "arm64",
            "x86_64" => "amd64",
            "x86" => "386",
            other => other,
        };
        Self {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_semantics() {
        let mut opts = RegistryOptions::default();
        assert_eq!(opts.ttl(), None);

        opts.ttl_secs = 0;
        assert_eq!(opts.ttl(), Some(Duration::ZERO));

        opts.ttl_secs = 3600;
        assert_eq!(opts.ttl(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_defaults_point_at_docker_hub() {
        let opts = RegistryOptions::default();
        assert_eq!(opts.api_base_url, "https://registry-1.docker.io");
        assert_eq!(opts.auth_base_url, "https://auth.docker.io");
        assert_eq!(opts.auth_service, "registry.docker.io");
    }

    #[test]
    fn test_deserialize_partial_options() {
        let opts: BuilderOptions =
            serde_json::from_str(r#"{"layers_dir": "/srv/layers", "registry": {"ttl_secs": 60}}"#)
                .unwrap();
        assert_eq!(opts.layers_dir, PathBuf::from("/srv/layers"));
        assert!(!opts.force);
        assert!(opts.mounts.is_empty());
        assert_eq!(opts.registry.ttl(), Some(Duration::from_secs(60)));
        assert_eq!(opts.registry.request_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_host_platform_uses_oci_names() {
        let platform = Platform::host();
        assert_eq!(platform.os, "linux");
        assert_ne!(platform.architecture, "x86_64");
        assert_ne!(platform.architecture, "aarch64");
    }
}
