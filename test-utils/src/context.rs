use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tempfile::TempDir;
use walkdir::WalkDir;

/// State of one entry in a [`BuildContext::snapshot`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryState {
    /// File bytes, link target, or empty for directories.
    pub content: Vec<u8>,
    pub is_dir: bool,
    pub mode: u32,
    pub mtime: SystemTime,
}

/// Temporary build context (`ctx/`) and layer store (`layers/`).
pub struct BuildContext {
    _tmp: TempDir,
    pub ctx_dir: PathBuf,
    pub layers_dir: PathBuf,
}

impl BuildContext {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let ctx_dir = tmp.path().join("ctx");
        let layers_dir = tmp.path().join("layers");
        fs::create_dir_all(&ctx_dir).unwrap();
        Self {
            _tmp: tmp,
            ctx_dir,
            layers_dir,
        }
    }

    /// Write a file under the context, creating parents.
    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.ctx_dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    #[cfg(unix)]
    pub fn chmod(&self, rel: &str, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(self.ctx_dir.join(rel), fs::Permissions::from_mode(mode)).unwrap();
    }

    pub fn layer(&self, id: &str) -> PathBuf {
        self.layers_dir.join(id)
    }

    /// Names of every entry in the layer store, sorted.
    pub fn stored_layers(&self) -> Vec<String> {
        let mut names = match fs::read_dir(&self.layers_dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    #[cfg(unix)]
    /// Every entry below `dir`, keyed by path relative to it.
    pub fn snapshot_of(dir: &Path) -> BTreeMap<PathBuf, EntryState> {
        use std::os::unix::fs::PermissionsExt;

        let mut entries = BTreeMap::new();
        for entry in WalkDir::new(dir).min_depth(1) {
            let entry = entry.unwrap();
            let metadata = entry.path().symlink_metadata().unwrap();
            let content = if metadata.file_type().is_symlink() {
                fs::read_link(entry.path()).unwrap().into_os_string().into_encoded_bytes()
            } else if metadata.is_file() {
                fs::read(entry.path()).unwrap()
            } else {
                Vec::new()
            };
            let rel = entry.path().strip_prefix(dir).unwrap().to_path_buf();
            entries.insert(
                rel,
                EntryState {
                    content,
                    is_dir: metadata.is_dir(),
                    mode: metadata.permissions().mode(),
                    mtime: metadata.modified().unwrap(),
                },
            );
        }
        entries
    }

    #[cfg(unix)]
    /// [`BuildContext::snapshot_of`] the whole layer store.
    pub fn snapshot(&self) -> BTreeMap<PathBuf, EntryState> {
        Self::snapshot_of(&self.layers_dir)
    }

    pub fn root(&self) -> &Path {
        self._tmp.path()
    }
}

impl Default for BuildContext {
    fn default() -> Self {
        Self::new()
    }
}
