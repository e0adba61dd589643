//! Hashing utilities for content-addressed layer ids and cache keys.
//!
//! - `hash_strings()`: id of a tuple of strings (layer ids)
//! - `hash_file()`: content hash of one file
//! - `hash_dir()`: deterministic hash of a directory tree (path, mode, content)
//! - `hash_sources()`: COPY cache key over several sources
//!
//! All hashes are lowercase hex SHA-256.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

/// Error during file or directory hashing.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("symlinks not implemented: {0}")]
    Symlink(PathBuf),
}

/// Hash a tuple of strings joined by `|`.
pub fn hash_strings<S: AsRef<str>>(parts: &[S]) -> String {
    let joined = parts
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<_>>()
        .join("|");
    hex::encode(Sha256::digest(joined.as_bytes()))
}

/// Hash the content of a single file.
pub fn hash_file(path: &Path) -> Result<String, HashError> {
    let read_err = |source| HashError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::open(path).map_err(read_err)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(read_err)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute a deterministic hash of a directory tree.
///
/// One line per regular file, `relpath mode contenthash`, sorted and joined
/// with newlines. Mode is the octal permission bits, so a chmod changes the
/// hash while a touch does not. Directories contribute only through their
/// files. Symlinks are rejected.
pub fn hash_dir(dir: &Path) -> Result<String, HashError> {
    let mut lines = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|source| HashError::Walk {
            path: dir.to_path_buf(),
            source,
        })?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            return Err(HashError::Symlink(entry.path().to_path_buf()));
        }
        if file_type.is_dir() {
            continue;
        }

        let metadata = entry.metadata().map_err(|source| HashError::Walk {
            path: entry.path().to_path_buf(),
            source,
        })?;
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        lines.push(format!(
            "{} {:o} {}",
            rel.display(),
            metadata.permissions().mode() & 0o7777,
            hash_file(entry.path())?
        ));
    }

    lines.sort();
    Ok(hex::encode(Sha256::digest(lines.join("\n").as_bytes())))
}

/// COPY cache key: files hashed by mode and content, directories by
/// `hash_dir`.
///
/// Sources are resolved relative to `ctx_dir`; order matters.
pub fn hash_sources<S: AsRef<str>>(ctx_dir: &Path, sources: &[S]) -> Result<String, HashError> {
    let mut hasher = Sha256::new();
    for src in sources {
        let path = ctx_dir.join(src.as_ref());
        let metadata = fs::symlink_metadata(&path).map_err(|source| HashError::Read {
            path: path.clone(),
            source,
        })?;
        if metadata.file_type().is_symlink() {
            return Err(HashError::Symlink(path));
        }
        let digest = if metadata.is_dir() {
            hash_dir(&path)?
        } else {
            format!(
                "{:o} {}",
                metadata.permissions().mode() & 0o7777,
                hash_file(&path)?
            )
        };
        hasher.update(digest.as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{FileTime, set_file_mtime};
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) -> PathBuf {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_hash_strings_is_deterministic() {
        let a = hash_strings(&["/ctx", "alpine:latest", "0", "RUN ls"]);
        let b = hash_strings(&["/ctx", "alpine:latest", "0", "RUN ls"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_strings(&["/ctx", "alpine:latest", "1", "RUN ls"]));
    }

    #[test]
    fn test_hash_strings_separator_matters() {
        assert_ne!(hash_strings(&["ab", "c"]), hash_strings(&["a", "bc"]));
    }

    #[test]
    fn test_hash_file_content_only() {
        let tmp = TempDir::new().unwrap();
        let a = write(tmp.path(), "a", "hello");
        let b = write(tmp.path(), "b", "hello");
        assert_eq!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
        // sha256("hello")
        assert_eq!(
            hash_file(&a).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hash_dir_mode_changes_hash() {
        let tmp = TempDir::new().unwrap();
        let file = write(tmp.path(), "src/run.sh", "echo hi");
        let before = hash_dir(&tmp.path().join("src")).unwrap();

        fs::set_permissions(&file, fs::Permissions::from_mode(0o755)).unwrap();
        let after = hash_dir(&tmp.path().join("src")).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn test_hash_dir_ignores_mtime() {
        let tmp = TempDir::new().unwrap();
        let file = write(tmp.path(), "src/data.txt", "payload");
        let before = hash_dir(&tmp.path().join("src")).unwrap();

        set_file_mtime(&file, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        let after = hash_dir(&tmp.path().join("src")).unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn test_hash_dir_sees_renames_and_nested_files() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "one/a/b.txt", "x");
        write(tmp.path(), "two/a/c.txt", "x");
        assert_ne!(
            hash_dir(&tmp.path().join("one")).unwrap(),
            hash_dir(&tmp.path().join("two")).unwrap()
        );
    }

    #[test]
    fn test_hash_dir_rejects_symlinks() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "src/real", "x");
        std::os::unix::fs::symlink("real", tmp.path().join("src/link")).unwrap();
        let err = hash_dir(&tmp.path().join("src")).unwrap_err();
        assert!(matches!(err, HashError::Symlink(_)));
    }

    #[test]
    fn test_hash_sources_mixes_files_and_dirs() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "file.txt", "a");
        write(tmp.path(), "dir/inner.txt", "b");

        let both = hash_sources(tmp.path(), &["file.txt", "dir"]).unwrap();
        let file_only = hash_sources(tmp.path(), &["file.txt"]).unwrap();
        assert_ne!(both, file_only);

        write(tmp.path(), "dir/inner.txt", "changed");
        assert_ne!(both, hash_sources(tmp.path(), &["file.txt", "dir"]).unwrap());
    }

    #[test]
    fn test_hash_sources_single_file_mode_changes_key() {
        let tmp = TempDir::new().unwrap();
        let script = write(tmp.path(), "run.sh", "echo hi");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
        let before = hash_sources(tmp.path(), &["run.sh"]).unwrap();

        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let after = hash_sources(tmp.path(), &["run.sh"]).unwrap();
        assert_ne!(before, after);

        set_file_mtime(&script, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        assert_eq!(after, hash_sources(tmp.path(), &["run.sh"]).unwrap());
    }

    #[test]
    fn test_hash_sources_missing_source_fails() {
        let tmp = TempDir::new().unwrap();
        let err = hash_sources(tmp.path(), &["nope"]).unwrap_err();
        assert!(matches!(err, HashError::Read { .. }));
    }
}
