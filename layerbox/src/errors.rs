//! Hierarchical error types for layerbox.
//!
//! Errors are grouped by the stage that produced them:
//! - [`ParseError`]: the build file is malformed (nothing was built yet)
//! - [`RegistryError`]: the base image pull failed
//! - [`SandboxError`]: namespace/mount/chroot setup or teardown failed
//! - [`BuildError`]: top-level error returned by the builder
//!
//! Several causes may be reported at once (a failing command plus a failing
//! unmount during teardown). Those are carried as siblings in a `Joined`
//! variant and rendered one per line.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Result alias used across the builder.
pub type BuildResult<T> = Result<T, BuildError>;

// ============================================================================
// Top-Level Error
// ============================================================================

/// Errors returned by [`crate::Builder`] and [`crate::dockerfile::parse`] callers.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The build file could not be parsed.
    #[error("parse: {0}")]
    Parse(#[from] ParseError),

    /// Pulling the base image failed.
    #[error("pull: {0}")]
    Pull(#[from] RegistryError),

    /// Sandbox setup or teardown failed.
    #[error("run: {0}")]
    Sandbox(#[from] SandboxError),

    /// The instruction's shell command exited unsuccessfully.
    #[error("failed to exec cmd {command:?}: {status}")]
    Execution { command: String, status: ExitStatus },

    /// The instruction's shell command could not be spawned.
    #[error("failed to exec cmd {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Reading or writing the layer store failed.
    #[error("layer {path}: {source}")]
    Layer {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A COPY instruction without both sources and a destination.
    #[error("invalid COPY: {0:?}")]
    InvalidCopy(String),

    /// Symlinked COPY sources are not supported.
    #[error("symlinks not implemented: {0}")]
    Symlink(PathBuf),

    /// Hashing a COPY source failed.
    #[error("hash: {0}")]
    Hash(#[from] crate::hash::HashError),

    /// A panic was caught at the build boundary.
    #[error("panic: {0}")]
    Panic(String),

    /// Several independent failures.
    #[error("{}", DisplayJoined(.0))]
    Joined(Vec<BuildError>),
}

impl BuildError {
    /// Wrap an I/O failure on a layer store path.
    pub fn layer(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Layer {
            path: path.into(),
            source,
        }
    }

    /// Combine causes into one error; `None` when there are none.
    ///
    /// Nested `Joined` values are flattened so the chain stays one level deep.
    pub fn join(errors: impl IntoIterator<Item = BuildError>) -> Option<BuildError> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                BuildError::Joined(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(BuildError::Joined(flat)),
        }
    }

    /// Every leaf cause, in order.
    pub fn causes(&self) -> Vec<&BuildError> {
        match self {
            BuildError::Joined(inner) => inner.iter().flat_map(|e| e.causes()).collect(),
            other => vec![other],
        }
    }
}

// ============================================================================
// Parse Errors
// ============================================================================

/// Errors from reading or parsing a build file.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The first instruction is not `FROM`.
    #[error("must start with FROM (first instruction: {found})")]
    MissingFrom { found: String },

    /// An instruction outside the supported set.
    #[error("unsupported cmd: {keyword} {value}")]
    Unsupported { keyword: String, value: String },

    /// An instruction keyword with nothing after it.
    #[error("{keyword} requires an argument")]
    MissingArgument { keyword: String },

    /// The build file could not be read.
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The context directory could not be made absolute.
    #[error("context dir {path}: {source}")]
    Context {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors while resolving, downloading or extracting a base image.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The image reference has no repository.
    #[error("invalid image reference {0:?}")]
    InvalidReference(String),

    /// Transport-level HTTP failure.
    #[error("GET {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The registry answered with a non-success status.
    #[error("GET {url}: bad status: {status}")]
    Status { url: String, status: u16 },

    /// A request exceeded the configured timeout.
    #[error("GET {url}: timed out after {secs}s")]
    Timeout { url: String, secs: u64 },

    /// Anonymous token exchange returned no token.
    #[error("no token returned for repository {0}")]
    MissingToken(String),

    /// The manifest list has no entry for this platform.
    #[error("no manifest for platform {os}/{arch} (available: {available})")]
    NoMatchingPlatform {
        os: String,
        arch: String,
        available: String,
    },

    /// A manifest that is neither an image manifest nor an index.
    #[error("manifest for {0} has neither layers nor manifests")]
    EmptyManifest(String),

    /// Downloaded blob does not match its digest.
    #[error("blob {digest}: digest mismatch (got sha256:{actual})")]
    DigestMismatch { digest: String, actual: String },

    /// Tar entry type outside dir/file/hardlink/symlink.
    #[error("unknown type: {kind:?} {path}")]
    UnsupportedEntry { kind: tar::EntryType, path: PathBuf },

    /// Resolving an entry path took too many symlink hops.
    #[error("too many levels of symbolic links: {0}")]
    SymlinkLoop(PathBuf),

    /// Malformed archive or extraction failure.
    #[error("extract {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Local filesystem failure outside extraction.
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Manifest or token body is not the expected JSON.
    #[error("decode {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RegistryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ============================================================================
// Sandbox Errors
// ============================================================================

/// Errors from namespace, mount and chroot handling.
///
/// Setup failures abort the sandbox; teardown failures are collected into
/// [`SandboxError::Joined`] next to whatever caused the teardown.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// A mount syscall failed.
    #[error("mount {src:?} on {dst} ({fstype}): {source}")]
    Mount {
        src: String,
        dst: PathBuf,
        fstype: String,
        #[source]
        source: io::Error,
    },

    /// A detach unmount failed during teardown.
    #[error("unmount {dst}: {source}")]
    Unmount {
        dst: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Entering the new root failed.
    #[error("chroot {path}: {source}")]
    Chroot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Restoring the original root or working directory failed.
    #[error("restore {step}: {source}")]
    Restore {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    /// Creating or joining namespaces failed.
    #[error("{op}: {source}")]
    Namespace {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// UID/GID mapping could not be installed or did not take effect.
    #[error("uid/gid mapping failed: {0}")]
    IdMapping(String),

    /// No SIGUSR1 arrived within the bound.
    #[error("timed out after {secs}s waiting for uid/gid mapping")]
    IdMapTimeout { secs: u64 },

    /// The re-executed namespaced child did not exit cleanly.
    #[error("namespaced child exited with status {code}")]
    ChildExited { code: i32 },

    /// The caller is not uid/gid 0 inside a user namespace.
    #[error("not running as mapped root (uid={uid} gid={gid}); re-exec into namespaces first")]
    NotMapped { uid: u32, gid: u32 },

    /// A bind spec that does not follow `src[:dst[:ro|rw]]`.
    #[error("invalid bind spec {spec:?}: {reason}")]
    BindSpec { spec: String, reason: String },

    /// Filesystem failure while preparing mount points.
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The scratch dir was left in place because a mount below it is still attached.
    #[error("{0}: left in place, a mount below it could not be detached")]
    ScratchKept(PathBuf),

    /// The function run inside the chroot failed.
    #[error("{0}")]
    Task(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// The function run inside the chroot panicked.
    #[error("panic inside chroot: {0}")]
    Panicked(String),

    /// Root cause and teardown failures, as siblings.
    #[error("{}", DisplayJoined(.0))]
    Joined(Vec<SandboxError>),
}

impl SandboxError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Combine causes into one error; `None` when there are none.
    pub fn join(errors: impl IntoIterator<Item = SandboxError>) -> Option<SandboxError> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                SandboxError::Joined(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(SandboxError::Joined(flat)),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Renders sibling errors one per line.
struct DisplayJoined<'a, E>(&'a [E]);

impl<E: fmt::Display> fmt::Display for DisplayJoined<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// Best-effort message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
