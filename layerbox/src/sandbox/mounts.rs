//! Mount helpers and bind spec parsing.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::statvfs::{FsFlags, statvfs};
use tracing::{debug, trace};

use crate::errors::SandboxError;

/// A parsed `src[:dst[:ro|rw]]` bind mount.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindSpec {
    pub src: PathBuf,
    /// Destination inside the new root.
    pub dst: PathBuf,
    pub read_only: bool,
}

impl BindSpec {
    /// Parse a bind spec. `dst` defaults to `src`; mode defaults to `ro`.
    pub fn parse(spec: &str) -> Result<Self, SandboxError> {
        let invalid = |reason: &str| SandboxError::BindSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = spec.split(':');
        let src = parts.next().unwrap_or_default();
        let dst = parts.next().unwrap_or_default();
        let mode = parts.next().unwrap_or_default();
        if parts.next().is_some() {
            return Err(invalid("too many fields"));
        }
        if src.is_empty() {
            return Err(invalid("empty source"));
        }

        let read_only = match mode {
            "" | "ro" => true,
            "rw" => false,
            _ => return Err(invalid("mode must be ro or rw")),
        };
        let dst = if dst.is_empty() { src } else { dst };

        Ok(Self {
            src: PathBuf::from(src),
            dst: PathBuf::from(dst),
            read_only,
        })
    }

    /// Where `dst` lands under `root`.
    pub fn target_in(&self, root: &Path) -> PathBuf {
        root.join(self.dst.strip_prefix("/").unwrap_or(&self.dst))
    }
}

/// Mount an overlay of `lower_dirs` (base first) with `upper_dir` on top.
pub fn mount_overlay(
    lower_dirs: &[PathBuf],
    upper_dir: &Path,
    work_dir: &Path,
    target: &Path,
) -> Result<(), SandboxError> {
    // overlayfs lowerdir format: topmost:...:bottommost
    let lowerdir = lower_dirs
        .iter()
        .rev()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    let data = format!(
        "lowerdir={},upperdir={},workdir={}",
        lowerdir,
        upper_dir.display(),
        work_dir.display()
    );
    debug!(target = %target.display(), "Mounting overlay: {}", data);

    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(data.as_str()),
    )
    .map_err(|e| SandboxError::Mount {
        src: lowerdir,
        dst: target.to_path_buf(),
        fstype: "overlay".into(),
        source: e.into(),
    })
}

/// Mount a pseudo filesystem (`proc`, `tmpfs`) on `target`.
pub fn mount_fs(fstype: &str, target: &Path) -> Result<(), SandboxError> {
    trace!("Mounting {} on {}", fstype, target.display());
    fs::create_dir_all(target).map_err(|e| SandboxError::io(target, e))?;
    mount(
        Some(fstype),
        target,
        Some(fstype),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| SandboxError::Mount {
        src: fstype.into(),
        dst: target.to_path_buf(),
        fstype: fstype.into(),
        source: e.into(),
    })
}

/// Bind `src` onto `target`, creating a matching mount point first.
///
/// Directories are bound recursively. Read-only binds are remounted
/// read-only, keeping the locked flags of the source mount.
pub fn bind(src: &Path, target: &Path, read_only: bool) -> Result<(), SandboxError> {
    let is_dir = create_mount_point(src, target)?;
    let mut flags = MsFlags::MS_BIND;
    if is_dir {
        flags |= MsFlags::MS_REC;
    }

    trace!(
        "Binding {} on {} (ro={})",
        src.display(),
        target.display(),
        read_only
    );
    let mount_err = |source: io::Error| SandboxError::Mount {
        src: src.display().to_string(),
        dst: target.to_path_buf(),
        fstype: "bind".into(),
        source,
    };
    mount(Some(src), target, None::<&str>, flags, None::<&str>).map_err(|e| mount_err(e.into()))?;

    if read_only {
        let remount = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | locked_flags(src);
        mount(None::<&str>, target, None::<&str>, remount, None::<&str>)
            .map_err(|e| mount_err(e.into()))?;
    }
    Ok(())
}

/// Detach-unmount `target`; busy mounts go away once unused.
pub fn unmount(target: &Path) -> Result<(), SandboxError> {
    trace!("Unmounting {}", target.display());
    umount2(target, MntFlags::MNT_DETACH).map_err(|e| SandboxError::Unmount {
        dst: target.to_path_buf(),
        source: e.into(),
    })
}

/// Create an empty dir or file at `target` to match `src`. Returns whether
/// `src` is a directory.
fn create_mount_point(src: &Path, target: &Path) -> Result<bool, SandboxError> {
    let metadata = fs::metadata(src).map_err(|e| SandboxError::io(src, e))?;
    if metadata.is_dir() {
        fs::create_dir_all(target).map_err(|e| SandboxError::io(target, e))?;
        return Ok(true);
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| SandboxError::io(parent, e))?;
    }
    if !target.exists() {
        fs::File::create(target).map_err(|e| SandboxError::io(target, e))?;
    }
    Ok(false)
}

/// Flags a read-only remount must keep inside a user namespace.
fn locked_flags(src: &Path) -> MsFlags {
    let Ok(stat) = statvfs(src) else {
        return MsFlags::empty();
    };
    let mut flags = MsFlags::empty();
    let fs_flags = stat.flags();
    if fs_flags.contains(FsFlags::ST_NOSUID) {
        flags |= MsFlags::MS_NOSUID;
    }
    if fs_flags.contains(FsFlags::ST_NODEV) {
        flags |= MsFlags::MS_NODEV;
    }
    if fs_flags.contains(FsFlags::ST_NOEXEC) {
        flags |= MsFlags::MS_NOEXEC;
    }
    flags
}
