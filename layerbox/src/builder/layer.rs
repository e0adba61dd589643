//! Layer directory bookkeeping: cache markers, sysext markers, wiping.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::constants::{layout, sysext};
use crate::errors::{BuildError, BuildResult};

pub(crate) fn marker_path(layer_dir: &Path) -> PathBuf {
    layer_dir.join(layout::LAYER_INFO_FILE)
}

/// Scratch dir used while rebuilding `layer_dir` (`<layer_dir>.tmp`).
pub(crate) fn scratch_path(layer_dir: &Path) -> PathBuf {
    let mut name = layer_dir.as_os_str().to_os_string();
    name.push(layout::SCRATCH_SUFFIX);
    PathBuf::from(name)
}

/// Stored cache key; a missing marker reads as empty.
pub(crate) fn read_marker(layer_dir: &Path) -> BuildResult<String> {
    let path = marker_path(layer_dir);
    match fs::read_to_string(&path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(BuildError::layer(path, e)),
    }
}

pub(crate) fn write_marker(layer_dir: &Path, key: &str) -> BuildResult<()> {
    let path = marker_path(layer_dir);
    fs::write(&path, key).map_err(|e| BuildError::layer(path, e))
}

/// Drop the marker so an interrupted rebuild is never taken as complete.
pub(crate) fn clear_marker(layer_dir: &Path) -> BuildResult<()> {
    remove_if_exists(&marker_path(layer_dir))
}

/// Write `usr/lib/extension-release.d/extension-release.<id>` unless it is
/// already there.
pub(crate) fn finalize_sysext(layer_dir: &Path) -> BuildResult<()> {
    let id = layer_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext_dir = layer_dir.join(sysext::EXTENSION_RELEASE_DIR);
    let ext_file = ext_dir.join(format!("{}{}", sysext::EXTENSION_RELEASE_PREFIX, id));

    if fs::read_to_string(&ext_file).is_ok_and(|c| c == sysext::EXTENSION_RELEASE_CONTENT) {
        return Ok(());
    }
    fs::create_dir_all(&ext_dir).map_err(|e| BuildError::layer(&ext_dir, e))?;
    fs::write(&ext_file, sysext::EXTENSION_RELEASE_CONTENT)
        .map_err(|e| BuildError::layer(ext_file, e))
}

/// Remove `path` (file or tree); absence is fine.
pub(crate) fn remove_if_exists(path: &Path) -> BuildResult<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| BuildError::layer(path, e))
}

pub(crate) fn recreate_dir(path: &Path) -> BuildResult<()> {
    remove_if_exists(path)?;
    fs::create_dir_all(path).map_err(|e| BuildError::layer(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_round_trip_and_clear() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(read_marker(tmp.path()).unwrap(), "");

        write_marker(tmp.path(), "key").unwrap();
        assert_eq!(read_marker(tmp.path()).unwrap(), "key");

        clear_marker(tmp.path()).unwrap();
        clear_marker(tmp.path()).unwrap();
        assert_eq!(read_marker(tmp.path()).unwrap(), "");
    }

    #[test]
    fn test_scratch_path_appends_suffix() {
        assert_eq!(
            scratch_path(Path::new("/layers/abc")),
            PathBuf::from("/layers/abc.tmp")
        );
    }

    #[test]
    fn test_finalize_sysext_writes_marker_once() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("deadbeef");
        fs::create_dir(&layer).unwrap();

        finalize_sysext(&layer).unwrap();
        let file = layer.join("usr/lib/extension-release.d/extension-release.deadbeef");
        assert_eq!(fs::read_to_string(&file).unwrap(), "ID=_any");

        let before = fs::metadata(&file).unwrap().modified().unwrap();
        finalize_sysext(&layer).unwrap();
        assert_eq!(fs::metadata(&file).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn test_recreate_dir_empties_existing_tree() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("d");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested/f"), "x").unwrap();

        recreate_dir(&dir).unwrap();
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }
}
