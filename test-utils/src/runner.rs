use std::fs;
use std::path::{Path, PathBuf};

use layerbox::{BuildError, BuildResult, Instruction, Runner};
use parking_lot::Mutex;

/// One call seen by [`RecordingRunner`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedRun {
    pub command: String,
    pub layer_dir: PathBuf,
    pub lower_dirs: Vec<PathBuf>,
    pub binds: Vec<String>,
}

/// Runner that writes `<layer>/run.out` with the command text.
///
/// Commands listed with [`RecordingRunner::fail_on`] fail with
/// [`BuildError::Spawn`] after being recorded.
#[derive(Default)]
pub struct RecordingRunner {
    runs: Mutex<Vec<RecordedRun>>,
    failing: Mutex<Vec<String>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, command: &str) {
        self.failing.lock().push(command.to_string());
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().clone()
    }

    /// Commands executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.runs.lock().iter().map(|r| r.command.clone()).collect()
    }

    pub fn clear(&self) {
        self.runs.lock().clear();
    }
}

impl Runner for RecordingRunner {
    fn run(
        &self,
        instruction: &Instruction,
        layer_dir: &Path,
        lower_dirs: &[PathBuf],
        binds: &[String],
    ) -> BuildResult<()> {
        self.runs.lock().push(RecordedRun {
            command: instruction.value.clone(),
            layer_dir: layer_dir.to_path_buf(),
            lower_dirs: lower_dirs.to_vec(),
            binds: binds.to_vec(),
        });

        if self.failing.lock().contains(&instruction.value) {
            return Err(BuildError::Spawn {
                command: instruction.value.clone(),
                source: std::io::Error::other("scripted failure"),
            });
        }

        let out = layer_dir.join("run.out");
        fs::write(&out, &instruction.value).map_err(|e| BuildError::layer(out, e))
    }
}
