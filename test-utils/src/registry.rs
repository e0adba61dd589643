use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use layerbox::{Registry, RegistryError};
use parking_lot::Mutex;

/// Registry that materializes a fixed file set.
///
/// A pull reports `true` when the directory content differs from the
/// current file set (first pull, or after [`MockRegistry::set_file`]).
#[derive(Default)]
pub struct MockRegistry {
    files: Mutex<BTreeMap<String, String>>,
    pulls: Mutex<Vec<(String, PathBuf)>>,
    fail_with: Mutex<Option<String>>,
}

impl MockRegistry {
    /// Registry serving a single `etc/os-release` file.
    pub fn new() -> Self {
        let registry = Self::default();
        registry.set_file("etc/os-release", "ID=mock\n");
        registry
    }

    /// Add or replace a file of the served image.
    pub fn set_file(&self, path: &str, content: &str) {
        self.files.lock().insert(path.to_string(), content.to_string());
    }

    /// Make every following pull fail with `InvalidReference(reason)`.
    pub fn fail(&self, reason: &str) {
        *self.fail_with.lock() = Some(reason.to_string());
    }

    /// `(image, dir)` of every pull so far.
    pub fn pulls(&self) -> Vec<(String, PathBuf)> {
        self.pulls.lock().clone()
    }

    fn is_current(&self, dir: &Path) -> bool {
        self.files
            .lock()
            .iter()
            .all(|(path, content)| fs::read_to_string(dir.join(path)).is_ok_and(|c| &c == content))
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn pull(&self, image: &str, dir: &Path) -> Result<bool, RegistryError> {
        self.pulls.lock().push((image.to_string(), dir.to_path_buf()));
        if let Some(reason) = self.fail_with.lock().clone() {
            return Err(RegistryError::InvalidReference(reason));
        }
        if self.is_current(dir) {
            return Ok(false);
        }

        let io = |path: &Path, source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        };
        if dir.exists() {
            fs::remove_dir_all(dir).map_err(|e| io(dir, e))?;
        }
        for (path, content) in self.files.lock().iter() {
            let target = dir.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| io(parent, e))?;
            }
            fs::write(&target, content).map_err(|e| io(&target, e))?;
        }
        Ok(true)
    }
}
