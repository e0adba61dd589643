//! COPY instructions.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use super::layer;
use crate::dockerfile::Instruction;
use crate::errors::{BuildError, BuildResult};
use crate::hash::{HashError, hash_sources};

/// Apply a COPY instruction to `layer_dir`. Returns whether it was rebuilt.
///
/// The cache key hashes every source (files by mode and content,
/// directories by path, mode and content). The layer is skipped when the key matches the
/// stored marker and nothing upstream changed.
pub(crate) fn copy(
    instruction: &Instruction,
    ctx_dir: &Path,
    layer_dir: &Path,
    changed: bool,
) -> BuildResult<bool> {
    let parts: Vec<&str> = instruction.value.split_whitespace().collect();
    let Some((dst, srcs)) = parts.split_last().filter(|(_, srcs)| !srcs.is_empty()) else {
        return Err(BuildError::InvalidCopy(instruction.value.clone()));
    };

    let key = hash_sources(ctx_dir, srcs).map_err(|e| match e {
        HashError::Symlink(path) => BuildError::Symlink(path),
        other => BuildError::Hash(other),
    })?;
    if !changed && layer::read_marker(layer_dir)? == key {
        debug!(id = %instruction.id, "COPY cache hit");
        return Ok(false);
    }

    layer::clear_marker(layer_dir)?;

    // The destination is always a directory, wiped and recreated; every
    // source lands in it under its own name.
    let dst_dir = join_within(layer_dir, &[instruction.work_dir.as_str(), *dst]);
    debug!(
        id = %instruction.id,
        dst = %dst_dir.display(),
        sources = srcs.len(),
        "COPY"
    );
    layer::recreate_dir(&dst_dir)?;

    for src in srcs {
        let src_path = ctx_dir.join(src);
        let metadata = fs::symlink_metadata(&src_path).map_err(|e| BuildError::layer(&src_path, e))?;
        if metadata.file_type().is_symlink() {
            return Err(BuildError::Symlink(src_path));
        }
        let Some(name) = source_name(&src_path) else {
            return Err(BuildError::InvalidCopy(instruction.value.clone()));
        };
        let target = dst_dir.join(name);

        if metadata.is_dir() {
            fs::create_dir_all(&target).map_err(|e| BuildError::layer(&target, e))?;
            copy_dir_contents(&src_path, &target)?;
            fs::set_permissions(&target, metadata.permissions())
                .map_err(|e| BuildError::layer(&target, e))?;
        } else {
            copy_file(&src_path, &target)?;
        }
    }

    layer::write_marker(layer_dir, &key)?;
    Ok(true)
}

/// Last component of `path` once `.` and `..` are folded away, so `.` names
/// the directory itself.
fn source_name(path: &Path) -> Option<OsString> {
    let mut parts: Vec<&OsStr> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(c) => parts.push(c),
            Component::ParentDir => {
                parts.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    parts.last().map(|n| n.to_os_string())
}

/// Join `parts` under `root` lexically, never climbing above `root`.
fn join_within(root: &Path, parts: &[&str]) -> PathBuf {
    let mut rel = PathBuf::new();
    for part in parts {
        for comp in Path::new(part).components() {
            match comp {
                Component::RootDir => rel = PathBuf::new(),
                Component::ParentDir => {
                    rel.pop();
                }
                Component::Normal(c) => rel.push(c),
                Component::CurDir | Component::Prefix(_) => {}
            }
        }
    }
    root.join(rel)
}

/// Copy the contents of `src` into `dst`, preserving modes.
fn copy_dir_contents(src: &Path, dst: &Path) -> BuildResult<()> {
    let mut dirs = Vec::new();

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            BuildError::layer(path, e.into())
        })?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            return Err(BuildError::Symlink(entry.path().to_path_buf()));
        } else if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| BuildError::layer(&target, e))?;
            dirs.push((entry.path().to_path_buf(), target));
        } else {
            copy_file(entry.path(), &target)?;
        }
    }

    // Directory modes last so read-only dirs can still be filled.
    for (src_dir, dst_dir) in dirs.into_iter().rev() {
        let perms = fs::metadata(&src_dir)
            .map_err(|e| BuildError::layer(&src_dir, e))?
            .permissions();
        fs::set_permissions(&dst_dir, perms).map_err(|e| BuildError::layer(&dst_dir, e))?;
    }
    Ok(())
}

fn copy_file(src: &Path, dst: &Path) -> BuildResult<()> {
    // fs::copy carries the permission bits over.
    fs::copy(src, dst).map_err(|e| BuildError::layer(dst, e))?;
    Ok(())
}
