//! Layer builder.
//!
//! Every `COPY` and `RUN` instruction owns one directory in the layer store,
//! keyed by its content-derived id. A layer is rebuilt when its cache marker
//! is stale or when anything below it was rebuilt during this build; the
//! second rule is carried as a sticky `changed` flag through the loop.

mod copy;
mod layer;
mod prune;
mod run;

#[cfg(target_os = "linux")]
pub use run::ChrootRunner;
pub use prune::{PruneStats, prune_layers};
pub use run::Runner;

use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dockerfile::{BuildFile, InstructionKind};
use crate::errors::{BuildError, BuildResult, panic_message};
use crate::images::Registry;
#[cfg(target_os = "linux")]
use crate::options::BuilderOptions;

// ============================================================================
// Summary
// ============================================================================

/// Result of one build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    pub base_id: String,
    /// Whether the base image content changed during this build.
    pub base_changed: bool,
    pub layers: Vec<LayerOutcome>,
}

impl BuildSummary {
    /// Number of layers that were rebuilt.
    pub fn rebuilt(&self) -> usize {
        self.layers.iter().filter(|l| l.changed).count()
    }
}

/// What happened to one instruction's layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LayerOutcome {
    pub id: String,
    pub kind: InstructionKind,
    /// `false` when the cached layer was reused.
    pub changed: bool,
}

// ============================================================================
// Builder
// ============================================================================

/// Builds parsed files into the layer store.
pub struct Builder {
    registry: Arc<dyn Registry>,
    runner: Arc<dyn Runner>,
    layers_dir: PathBuf,
    force: bool,
    mounts: Vec<String>,
}

impl Builder {
    pub fn new(
        registry: Arc<dyn Registry>,
        runner: Arc<dyn Runner>,
        layers_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            runner,
            layers_dir: layers_dir.into(),
            force: false,
            mounts: Vec::new(),
        }
    }

    /// Production builder: Docker registry client plus the chroot runner.
    #[cfg(target_os = "linux")]
    pub fn from_options(options: &BuilderOptions) -> BuildResult<Self> {
        let registry = crate::images::DockerRegistry::new(&options.registry)?;
        Ok(Self::new(Arc::new(registry), Arc::new(ChrootRunner), &options.layers_dir)
            .with_force(options.force)
            .with_mounts(options.mounts.clone()))
    }

    /// Treat every layer as stale.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Bind specs mounted into every RUN step, ahead of the file's own.
    pub fn with_mounts(mut self, mounts: Vec<String>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn layers_dir(&self) -> &Path {
        &self.layers_dir
    }

    /// Directory of the layer with the given id.
    pub fn layer_dir(&self, id: &str) -> PathBuf {
        self.layers_dir.join(id)
    }

    /// Build `file`, reusing every layer whose cache key still matches.
    ///
    /// The process working directory is switched to the build context
    /// (`ctx_dir`, or the file's own) for the duration of the build and
    /// restored afterwards. A panic anywhere in the loop is returned as
    /// [`BuildError::Panic`].
    pub async fn build(&self, file: &BuildFile, ctx_dir: Option<&Path>) -> BuildResult<BuildSummary> {
        let layers_dir = std::path::absolute(&self.layers_dir)
            .map_err(|e| BuildError::layer(&self.layers_dir, e))?;
        let ctx_dir = ctx_dir.unwrap_or(file.ctx_dir.as_path());
        let ctx_dir = std::path::absolute(ctx_dir).map_err(|e| BuildError::layer(ctx_dir, e))?;

        let _cwd = CwdGuard::enter(&ctx_dir)?;
        AssertUnwindSafe(self.build_layers(file, &ctx_dir, &layers_dir))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(BuildError::Panic(panic_message(payload.as_ref()))))
    }

    async fn build_layers(
        &self,
        file: &BuildFile,
        ctx_dir: &Path,
        layers_dir: &Path,
    ) -> BuildResult<BuildSummary> {
        let total = file.layers.len();
        fs::create_dir_all(layers_dir).map_err(|e| BuildError::layer(layers_dir, e))?;

        let base_dir = layers_dir.join(&file.base_id);
        info!("FROM {} ({}/{})", file.base, 0, total);
        let base_changed = self.registry.pull(&file.base, &base_dir).await?;
        debug!(base = %file.base, base_changed, "base ready");

        let mut changed = base_changed || self.force;
        let mut lower_dirs = vec![base_dir];
        let mut layers = Vec::with_capacity(total);

        for (i, instruction) in file.layers.iter().enumerate() {
            info!("{} ({}/{})", instruction, i + 1, total);
            let layer_dir = layers_dir.join(&instruction.id);
            fs::create_dir_all(&layer_dir).map_err(|e| BuildError::layer(&layer_dir, e))?;

            let rebuilt = match instruction.kind {
                InstructionKind::Copy => copy::copy(instruction, ctx_dir, &layer_dir, changed)?,
                InstructionKind::Run => run::run(
                    self.runner.as_ref(),
                    instruction,
                    &layer_dir,
                    &lower_dirs,
                    &self.mounts,
                    changed,
                )?,
            };
            changed |= rebuilt;

            layer::finalize_sysext(&layer_dir)?;
            lower_dirs.push(layer_dir);
            layers.push(LayerOutcome {
                id: instruction.id.clone(),
                kind: instruction.kind,
                changed: rebuilt,
            });
        }

        Ok(BuildSummary {
            base_id: file.base_id.clone(),
            base_changed,
            layers,
        })
    }

    /// Remove every layer not referenced by one of the `(file, ctx_dir)`
    /// pairs. `file` is a path or inline content, as for
    /// [`crate::dockerfile::parse`].
    pub fn prune(&self, referenced: &[(String, PathBuf)]) -> BuildResult<PruneStats> {
        prune_layers(&self.layers_dir, referenced)
    }
}

/// Switches the process cwd and switches it back on drop.
struct CwdGuard {
    previous: Option<PathBuf>,
}

impl CwdGuard {
    fn enter(dir: &Path) -> BuildResult<Self> {
        let previous = std::env::current_dir().ok();
        std::env::set_current_dir(dir).map_err(|e| BuildError::layer(dir, e))?;
        Ok(Self { previous })
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take()
            && let Err(e) = std::env::set_current_dir(&previous)
        {
            warn!(cwd = %previous.display(), error = %e, "failed to restore working directory");
        }
    }
}
