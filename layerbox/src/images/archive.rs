//! Layer blob extraction.
//!
//! Blobs are gzip-compressed (or plain) tar streams. Supported entries are
//! directories, regular files, hardlinks and symlinks; OCI whiteouts are
//! applied inline. Anything else aborts extraction.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use filetime::{FileTime, set_file_mtime};
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::errors::RegistryError;

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";
const MAX_SYMLINK_HOPS: usize = 40;

/// Extract a downloaded blob into `dest`, detecting gzip by its magic bytes.
///
/// Returns the number of entries written.
pub fn extract_blob(blob: &Path, dest: &Path) -> Result<u64, RegistryError> {
    let archive_err = |source| RegistryError::Archive {
        path: blob.to_path_buf(),
        source,
    };

    let mut file = fs::File::open(blob).map_err(archive_err)?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic).map_err(archive_err)?;
    let file = fs::File::open(blob).map_err(archive_err)?;

    // Gzip magic number: 0x1f 0x8b
    let reader: Box<dyn Read> = if n == 2 && magic == [0x1f, 0x8b] {
        trace!("Detected gzip compression for {}", blob.display());
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        trace!("Detected uncompressed tarball for {}", blob.display());
        Box::new(BufReader::new(file))
    };

    apply_layer(reader, dest)
}

/// Apply one tar stream on top of `dest`.
pub fn apply_layer<R: Read>(reader: R, dest: &Path) -> Result<u64, RegistryError> {
    let archive_err = |source| RegistryError::Archive {
        path: dest.to_path_buf(),
        source,
    };

    fs::create_dir_all(dest).map_err(archive_err)?;

    let mut archive = Archive::new(reader);
    let mut unpacked: HashSet<PathBuf> = HashSet::new();
    let mut dirs: Vec<(PathBuf, u32, u64)> = Vec::new();
    let mut count = 0u64;

    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        let raw_path = entry.path().map_err(archive_err)?.into_owned();
        let Some(rel) = normalize_entry_path(&raw_path) else {
            debug!("Skipping path outside root: {}", raw_path.display());
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }

        let path = resolve_in_root(dest, &rel)?;
        let header = entry.header();
        let entry_type = header.entry_type();
        let mode = header.mode().unwrap_or(0o755) & 0o7777;
        let mtime = header.mtime().unwrap_or(0);

        trace!(
            "Processing entry: path={}, type={:?}, mode={:o}",
            rel.display(),
            entry_type,
            mode
        );

        if entry_type == EntryType::Regular && handle_whiteout(&path, &unpacked)? {
            continue;
        }

        match entry_type {
            EntryType::Directory => {
                remove_unless_dir(&path)?;
                fs::create_dir_all(&path).map_err(|e| RegistryError::io(&path, e))?;
                dirs.push((path.clone(), mode, mtime));
            }
            EntryType::Regular => {
                ensure_parent(&path)?;
                remove_unless_dir(&path)?;
                let mut out = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(mode)
                    .open(&path)
                    .map_err(|e| RegistryError::io(&path, e))?;
                io::copy(&mut entry, &mut out).map_err(archive_err)?;
                // Umask may have masked the requested bits.
                fs::set_permissions(&path, Permissions::from_mode(mode))
                    .map_err(|e| RegistryError::io(&path, e))?;
                set_file_mtime(&path, FileTime::from_unix_time(mtime as i64, 0))
                    .map_err(|e| RegistryError::io(&path, e))?;
            }
            EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(archive_err)?
                    .and_then(|t| normalize_entry_path(&t))
                    .ok_or_else(|| RegistryError::UnsupportedEntry {
                        kind: entry_type,
                        path: raw_path.clone(),
                    })?;
                let target = resolve_in_root(dest, &target)?;
                ensure_parent(&path)?;
                remove_unless_dir(&path)?;
                fs::hard_link(&target, &path).map_err(|e| RegistryError::io(&path, e))?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(archive_err)?
                    .ok_or_else(|| RegistryError::UnsupportedEntry {
                        kind: entry_type,
                        path: raw_path.clone(),
                    })?
                    .into_owned();
                ensure_parent(&path)?;
                remove_unless_dir(&path)?;
                std::os::unix::fs::symlink(&target, &path)
                    .map_err(|e| RegistryError::io(&path, e))?;
            }
            EntryType::XGlobalHeader => {
                trace!("Ignoring PAX global header {}", raw_path.display());
                continue;
            }
            other => {
                return Err(RegistryError::UnsupportedEntry {
                    kind: other,
                    path: raw_path,
                });
            }
        }

        unpacked.insert(path);
        count += 1;
    }

    // Directory metadata last, deepest first, so writing children does not
    // bump mtimes or trip over read-only modes.
    for (path, mode, mtime) in dirs.into_iter().rev() {
        fs::set_permissions(&path, Permissions::from_mode(mode))
            .map_err(|e| RegistryError::io(&path, e))?;
        set_file_mtime(&path, FileTime::from_unix_time(mtime as i64, 0))
            .map_err(|e| RegistryError::io(&path, e))?;
    }

    Ok(count)
}

/// Strip root and `.` components; `None` if `..` climbs above the root.
fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut components = Vec::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                components.pop()?;
            }
            Component::Normal(c) => components.push(c.to_os_string()),
        }
    }
    Some(components.into_iter().collect())
}

/// Map `rel` to a path under `root`, following symlinked parent components
/// as if `root` were `/`.
///
/// The final component is never followed. Absolute link targets restart at
/// `root` and `..` stops at `root`, so the result always lies inside it.
fn resolve_in_root(root: &Path, rel: &Path) -> Result<PathBuf, RegistryError> {
    let Some(name) = rel.file_name() else {
        return Ok(root.to_path_buf());
    };

    let mut pending: Vec<OsString> = Vec::new();
    push_components(&mut pending, rel.parent().unwrap_or(Path::new("")));
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&part);
        let on_disk = root.join(&candidate);
        match fs::symlink_metadata(&on_disk) {
            Ok(m) if m.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(RegistryError::SymlinkLoop(rel.to_path_buf()));
                }
                let target = fs::read_link(&on_disk).map_err(|e| RegistryError::io(&on_disk, e))?;
                trace!("Resolving {} -> {} inside root", candidate.display(), target.display());
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                push_components(&mut pending, &target);
            }
            _ => resolved = candidate,
        }
    }

    Ok(root.join(resolved).join(name))
}

/// Queue `path`'s components so that popping yields them in order.
fn push_components(pending: &mut Vec<OsString>, path: &Path) {
    let parts = path.components().filter_map(|c| match c {
        Component::Normal(n) => Some(n.to_os_string()),
        Component::ParentDir => Some(OsString::from("..")),
        Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
    });
    let parts: Vec<OsString> = parts.collect();
    pending.extend(parts.into_iter().rev());
}

/// Apply `.wh.<name>` and opaque markers. Returns true if `path` was one.
fn handle_whiteout(path: &Path, unpacked: &HashSet<PathBuf>) -> Result<bool, RegistryError> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(false);
    };
    let Some(parent) = path.parent() else {
        return Ok(false);
    };

    if name == WHITEOUT_OPAQUE {
        if !parent.exists() {
            return Ok(true);
        }
        for entry in WalkDir::new(parent).min_depth(1).contents_first(true) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    trace!("Skipping walk entry in {}: {}", parent.display(), e);
                    continue;
                }
            };
            let target = entry.path();
            if unpacked.iter().any(|p| p.starts_with(target)) {
                continue;
            }
            remove_path(target)?;
        }
        debug!("Opaque whiteout applied to {}", parent.display());
        return Ok(true);
    }

    if let Some(target_name) = name.strip_prefix(WHITEOUT_PREFIX) {
        let target = parent.join(target_name);
        remove_path(&target)?;
        debug!("Whiteout removed {}", target.display());
        return Ok(true);
    }

    Ok(false)
}

fn ensure_parent(path: &Path) -> Result<(), RegistryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| RegistryError::io(parent, e))?;
    }
    Ok(())
}

/// Clear whatever sits at `path`, keeping an existing directory.
fn remove_unless_dir(path: &Path) -> Result<(), RegistryError> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => Ok(()),
        Ok(_) => fs::remove_file(path).map_err(|e| RegistryError::io(path, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RegistryError::io(path, e)),
    }
}

fn remove_path(path: &Path) -> Result<(), RegistryError> {
    let result = match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| RegistryError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    fn header(entry_type: EntryType, mode: u32, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mode(mode);
        header.set_size(size);
        header.set_mtime(1_700_000_000);
        header
    }

    fn tarball(build: impl FnOnce(&mut tar::Builder<Vec<u8>>)) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        build(&mut builder);
        builder.into_inner().unwrap()
    }

    fn add_file(b: &mut tar::Builder<Vec<u8>>, path: &str, content: &[u8], mode: u32) {
        let mut h = header(EntryType::Regular, mode, content.len() as u64);
        b.append_data(&mut h, path, content).unwrap();
    }

    fn add_dir(b: &mut tar::Builder<Vec<u8>>, path: &str) {
        let mut h = header(EntryType::Directory, 0o755, 0);
        b.append_data(&mut h, path, io::empty()).unwrap();
    }

    fn add_link(b: &mut tar::Builder<Vec<u8>>, kind: EntryType, path: &str, target: &str) {
        let mut h = header(kind, 0o777, 0);
        b.append_link(&mut h, path, target).unwrap();
    }

    #[test]
    fn test_extracts_supported_entry_types() {
        let data = tarball(|b| {
            add_dir(b, "etc");
            add_file(b, "etc/os-release", b"ID=test\n", 0o644);
            add_file(b, "bin/tool", b"#!/bin/sh\n", 0o755);
            add_link(b, EntryType::Link, "bin/tool2", "bin/tool");
            add_link(b, EntryType::Symlink, "bin/sh", "tool");
        });
        let tmp = TempDir::new().unwrap();

        let count = apply_layer(data.as_slice(), tmp.path()).unwrap();

        assert_eq!(count, 5);
        assert_eq!(
            fs::read_to_string(tmp.path().join("etc/os-release")).unwrap(),
            "ID=test\n"
        );
        let tool = fs::metadata(tmp.path().join("bin/tool")).unwrap();
        assert_eq!(tool.mode() & 0o777, 0o755);
        let tool2 = fs::metadata(tmp.path().join("bin/tool2")).unwrap();
        assert_eq!(tool.ino(), tool2.ino());
        assert_eq!(
            fs::read_link(tmp.path().join("bin/sh")).unwrap(),
            PathBuf::from("tool")
        );
    }

    #[test]
    fn test_rejects_unknown_entry_type() {
        let data = tarball(|b| {
            let mut h = header(EntryType::Fifo, 0o644, 0);
            b.append_data(&mut h, "pipe", io::empty()).unwrap();
        });
        let tmp = TempDir::new().unwrap();

        let err = apply_layer(data.as_slice(), tmp.path()).unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedEntry { .. }));
        assert!(err.to_string().starts_with("unknown type"));
    }

    #[test]
    fn test_whiteouts_remove_lower_entries() {
        let tmp = TempDir::new().unwrap();
        let lower = tarball(|b| {
            add_file(b, "keep.txt", b"k", 0o644);
            add_file(b, "gone.txt", b"g", 0o644);
            add_file(b, "opaque/old.txt", b"o", 0o644);
        });
        apply_layer(lower.as_slice(), tmp.path()).unwrap();

        let upper = tarball(|b| {
            add_file(b, ".wh.gone.txt", b"", 0o644);
            add_file(b, "opaque/new.txt", b"n", 0o644);
            add_file(b, "opaque/.wh..wh..opq", b"", 0o644);
        });
        apply_layer(upper.as_slice(), tmp.path()).unwrap();

        assert!(tmp.path().join("keep.txt").exists());
        assert!(!tmp.path().join("gone.txt").exists());
        assert!(!tmp.path().join(".wh.gone.txt").exists());
        assert!(tmp.path().join("opaque/new.txt").exists());
        assert!(!tmp.path().join("opaque/old.txt").exists());
    }

    #[test]
    fn test_symlinked_parent_cannot_escape_dest() {
        let outside = TempDir::new().unwrap();
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("rootfs");
        let data = tarball(|b| {
            add_link(b, EntryType::Symlink, "evil", outside.path().to_str().unwrap());
            add_file(b, "evil/pwned", b"owned", 0o644);
            add_link(b, EntryType::Symlink, "up", "../../..");
            add_file(b, "up/escaped", b"x", 0o644);
        });

        apply_layer(data.as_slice(), &dest).unwrap();

        assert!(!outside.path().join("pwned").exists());
        assert_eq!(fs::read_dir(outside.path()).unwrap().count(), 0);
        let rel = outside.path().strip_prefix("/").unwrap();
        assert_eq!(fs::read(dest.join(rel).join("pwned")).unwrap(), b"owned");
        assert!(dest.join("escaped").is_file());
        assert!(fs::symlink_metadata(dest.join("evil")).unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_symlinked_parent_inside_root_is_followed() {
        let tmp = TempDir::new().unwrap();
        let data = tarball(|b| {
            add_dir(b, "usr/lib");
            add_link(b, EntryType::Symlink, "lib", "usr/lib");
            add_file(b, "lib/libc.so", b"elf", 0o755);
        });

        apply_layer(data.as_slice(), tmp.path()).unwrap();
        assert_eq!(fs::read(tmp.path().join("usr/lib/libc.so")).unwrap(), b"elf");
    }

    #[test]
    fn test_hardlink_target_resolves_inside_dest() {
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret"), "host").unwrap();
        let tmp = TempDir::new().unwrap();
        let data = tarball(|b| {
            add_link(b, EntryType::Symlink, "evil", outside.path().to_str().unwrap());
            add_link(b, EntryType::Link, "stolen", "evil/secret");
        });

        assert!(apply_layer(data.as_slice(), tmp.path()).is_err());
        assert!(!tmp.path().join("stolen").exists());
        assert_eq!(fs::metadata(outside.path().join("secret")).unwrap().nlink(), 1);
    }

    #[test]
    fn test_whiteout_through_symlink_stays_inside_dest() {
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("keep"), "host").unwrap();
        let tmp = TempDir::new().unwrap();
        let data = tarball(|b| {
            add_link(b, EntryType::Symlink, "evil", outside.path().to_str().unwrap());
            add_file(b, "evil/.wh.keep", b"", 0o644);
        });

        apply_layer(data.as_slice(), tmp.path()).unwrap();
        assert!(outside.path().join("keep").exists());
    }

    #[test]
    fn test_symlink_loop_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let data = tarball(|b| {
            add_link(b, EntryType::Symlink, "a", "b");
            add_link(b, EntryType::Symlink, "b", "a");
            add_file(b, "a/file", b"x", 0o644);
        });

        let err = apply_layer(data.as_slice(), tmp.path()).unwrap_err();
        assert!(matches!(err, RegistryError::SymlinkLoop(_)));
    }

    #[test]
    fn test_normalize_entry_path() {
        assert_eq!(
            normalize_entry_path(Path::new("/a/./b")),
            Some(PathBuf::from("a/b"))
        );
        assert_eq!(
            normalize_entry_path(Path::new("a/../b")),
            Some(PathBuf::from("b"))
        );
        assert_eq!(normalize_entry_path(Path::new("../etc/passwd")), None);
    }

    #[test]
    fn test_extract_blob_detects_gzip() {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write;

        let data = tarball(|b| add_file(b, "hello", b"world", 0o600));
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&data).unwrap();

        let tmp = TempDir::new().unwrap();
        let blob = tmp.path().join("blob");
        fs::write(&blob, gz.finish().unwrap()).unwrap();
        let plain = tmp.path().join("plain");
        fs::write(&plain, &data).unwrap();

        extract_blob(&blob, &tmp.path().join("a")).unwrap();
        extract_blob(&plain, &tmp.path().join("b")).unwrap();
        assert_eq!(fs::read(tmp.path().join("a/hello")).unwrap(), b"world");
        assert_eq!(fs::read(tmp.path().join("b/hello")).unwrap(), b"world");
    }
}
