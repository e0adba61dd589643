//! Daemonless image builder.
//!
//! A restricted Dockerfile is parsed into content-addressed layers
//! ([`dockerfile`]), its base image is pulled from a registry ([`images`]),
//! and every `COPY`/`RUN` layer is rebuilt only when its inputs changed
//! ([`builder`]). `RUN` steps execute inside user/mount/pid namespaces on an
//! overlayfs root ([`sandbox`], Linux only).

pub mod builder;
pub mod constants;
pub mod dockerfile;
pub mod errors;
pub mod hash;
pub mod images;
pub mod options;
#[cfg(target_os = "linux")]
pub mod sandbox;

#[cfg(target_os = "linux")]
pub use builder::ChrootRunner;
pub use builder::{BuildSummary, Builder, LayerOutcome, PruneStats, Runner};
pub use dockerfile::{BuildFile, Instruction, InstructionKind, parse, parse_str};
pub use errors::{BuildError, BuildResult, ParseError, RegistryError, SandboxError};
pub use images::{DockerRegistry, ImageRef, Registry};
pub use options::{BuilderOptions, Platform, RegistryOptions};
