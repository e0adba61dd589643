//! Constants for layerbox.
//!
//! Centralized location for file names, on-disk layout and environment keys.

/// Layer store layout.
pub mod layout {
    /// Base directory name for layerbox data (under the user's home)
    pub const LAYERBOX_DIR: &str = ".layerbox";

    /// Subdirectory holding one directory per layer
    pub const LAYERS_DIR: &str = "layers";

    /// Cache-key marker written into every layer directory
    pub const LAYER_INFO_FILE: &str = ".layer.txt";

    /// Suffix of the scratch directory next to a layer being rebuilt
    pub const SCRATCH_SUFFIX: &str = ".tmp";
}

/// systemd system-extension marker written into non-base layers.
pub mod sysext {
    /// Directory (relative to the layer root) holding extension-release files
    pub const EXTENSION_RELEASE_DIR: &str = "usr/lib/extension-release.d";

    /// File name prefix; the layer id is appended
    pub const EXTENSION_RELEASE_PREFIX: &str = "extension-release.";

    /// Marker content accepted by any host
    pub const EXTENSION_RELEASE_CONTENT: &str = "ID=_any";
}

pub mod envs {
    /// Overrides the layerbox home directory
    pub const LAYERBOX_HOME: &str = "LAYERBOX_HOME";

    /// Set on the re-executed child so it knows it is already namespaced
    pub const REEXEC_MARKER: &str = "RE_EXEC_NAMESPACED";
}

/// Docker Hub endpoints used by the default registry.
pub mod registry {
    pub const DOCKER_HUB_API: &str = "https://registry-1.docker.io";
    pub const DOCKER_HUB_AUTH: &str = "https://auth.docker.io";
    pub const DOCKER_HUB_SERVICE: &str = "registry.docker.io";

    /// Namespace prepended to single-component repositories
    pub const OFFICIAL_NAMESPACE: &str = "library";

    /// Tag used when the reference has none
    pub const DEFAULT_TAG: &str = "latest";
}

/// Manifest and blob media types.
pub mod media_types {
    pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
}

/// Sandbox mounts.
pub mod sandbox {
    /// Always bound into the chroot so RUN steps can resolve names
    pub const RESOLV_CONF: &str = "/etc/resolv.conf";

    /// Default bound on waiting for the parent to install ID mappings (seconds)
    pub const ID_MAP_TIMEOUT_SECS: u64 = 30;

    /// Subordinate ID range handed to newuidmap/newgidmap for non-root users
    pub const SUBID_START: u32 = 100_000;
    pub const SUBID_COUNT: u32 = 65_536;
}
