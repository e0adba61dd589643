//! Namespace and overlayfs sandbox.
//!
//! [`reexec_namespaced`] puts the process into fresh user, mount and pid
//! namespaces. Inside them [`run_in_chroot`] assembles an overlay root,
//! chroots into it, runs a callback and tears everything down again.
//!
//! Both mutate process-wide state (root, cwd, signal mask) and must not be
//! used from several threads at once.

mod mounts;
mod namespace;
mod undo;

pub use mounts::BindSpec;
pub use namespace::{
    IdMapper, NewIdMap, ProcIdMap, await_id_mapping, host_id_mapper, reexec_namespaced,
};
pub use undo::UndoStack;

use std::cell::Cell;
use std::error::Error;
use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::unistd::{Gid, Uid, chdir, chroot};
use tracing::{debug, warn};

use crate::constants::sandbox::RESOLV_CONF;
use crate::errors::{SandboxError, panic_message};

/// Run `f` inside a chroot of `lower_dirs` (base first) overlaid by `upper_dir`.
///
/// `scratch_dir` holds the mount point and the overlay work dir. `/dev`,
/// `/proc`, `/tmp`, `/etc/resolv.conf` and every bind spec are mounted into
/// the new root.
///
/// The caller must be mapped root inside its namespaces. Whatever happens
/// (including `f` failing or panicking) the mounts are detached and the
/// original root and cwd restored; every failure along the way is reported
/// as a sibling in the returned error. The scratch dir is removed last, and
/// kept if any unmount failed.
pub fn run_in_chroot<F, E>(
    lower_dirs: &[PathBuf],
    upper_dir: &Path,
    scratch_dir: &Path,
    binds: &[String],
    f: F,
) -> Result<(), SandboxError>
where
    F: FnOnce() -> Result<(), E>,
    E: Into<Box<dyn Error + Send + Sync + 'static>>,
{
    let (uid, gid) = (Uid::current(), Gid::current());
    if !uid.is_root() || gid.as_raw() != 0 {
        return Err(SandboxError::NotMapped {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
        });
    }

    let specs = bind_specs(binds)?;
    let mut undo = UndoStack::new();
    let mut errors = Vec::new();

    match enter_root(lower_dirs, upper_dir, scratch_dir, &specs, &mut undo) {
        Ok(()) => match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(SandboxError::Task(e.into())),
            Err(payload) => errors.push(SandboxError::Panicked(panic_message(payload.as_ref()))),
        },
        Err(e) => errors.push(e),
    }

    errors.extend(undo.unwind());
    match SandboxError::join(errors) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Parse declared binds and add the host resolver config when present.
fn bind_specs(binds: &[String]) -> Result<Vec<BindSpec>, SandboxError> {
    let mut specs = binds
        .iter()
        .map(|b| BindSpec::parse(b))
        .collect::<Result<Vec<_>, _>>()?;

    if Path::new(RESOLV_CONF).exists() {
        specs.push(BindSpec::parse(RESOLV_CONF)?);
    } else {
        warn!("{} not found, RUN steps will have no resolver", RESOLV_CONF);
    }
    Ok(specs)
}

/// Build the overlay root and chroot into it, registering teardown as it goes.
fn enter_root(
    lower_dirs: &[PathBuf],
    upper_dir: &Path,
    scratch_dir: &Path,
    specs: &[BindSpec],
    undo: &mut UndoStack,
) -> Result<(), SandboxError> {
    let absolute = |p: &Path| std::path::absolute(p).map_err(|e| SandboxError::io(p, e));
    let scratch_dir = absolute(scratch_dir)?;
    let upper_dir = absolute(upper_dir)?;
    let lower_dirs = lower_dirs
        .iter()
        .map(|p| absolute(p.as_path()))
        .collect::<Result<Vec<_>, _>>()?;

    let chroot_dir = scratch_dir.join("chroot");
    let work_dir = scratch_dir.join("work");

    fs::create_dir_all(&scratch_dir).map_err(|e| SandboxError::io(&scratch_dir, e))?;
    // Set by any unmount step that fails; the scratch removal runs last.
    let detach_failed = Rc::new(Cell::new(false));
    {
        let scratch_dir = scratch_dir.clone();
        let detach_failed = detach_failed.clone();
        undo.push(move || remove_scratch(&scratch_dir, !detach_failed.get()));
    }
    for dir in [&chroot_dir, &work_dir, &upper_dir] {
        fs::create_dir_all(dir).map_err(|e| SandboxError::io(dir, e))?;
    }

    mounts::mount_overlay(&lower_dirs, &upper_dir, &work_dir, &chroot_dir)?;
    push_unmount(undo, &detach_failed, chroot_dir.clone());

    let dev = chroot_dir.join("dev");
    mounts::bind(Path::new("/dev"), &dev, false)?;
    push_unmount(undo, &detach_failed, dev);

    let proc = chroot_dir.join("proc");
    mounts::mount_fs("proc", &proc)?;
    push_unmount(undo, &detach_failed, proc);

    let tmp = chroot_dir.join("tmp");
    mounts::mount_fs("tmpfs", &tmp)?;
    push_unmount(undo, &detach_failed, tmp);

    for spec in specs {
        let target = spec.target_in(&chroot_dir);
        mounts::bind(&spec.src, &target, spec.read_only)?;
        push_unmount(undo, &detach_failed, target);
    }

    // Restore handles must be taken before leaving the host root.
    let orig_pwd = std::env::current_dir().map_err(|source| SandboxError::Restore {
        step: "getcwd",
        source,
    })?;
    let host_root = fs::File::open("/").map_err(|e| SandboxError::io("/", e))?;
    undo.push(move || restore_root(&host_root, &orig_pwd));

    debug!(root = %chroot_dir.display(), "Entering chroot");
    chroot(&chroot_dir).map_err(|e| SandboxError::Chroot {
        path: chroot_dir.clone(),
        source: e.into(),
    })?;
    chdir("/").map_err(|e| SandboxError::Chroot {
        path: chroot_dir,
        source: e.into(),
    })?;
    Ok(())
}

fn push_unmount(undo: &mut UndoStack, detach_failed: &Rc<Cell<bool>>, target: PathBuf) {
    let detach_failed = detach_failed.clone();
    undo.push(move || {
        let result = mounts::unmount(&target);
        if result.is_err() {
            detach_failed.set(true);
        }
        result
    });
}

/// Remove the scratch dir, unless a mount below it may still be attached.
fn remove_scratch(scratch_dir: &Path, mounts_detached: bool) -> Result<(), SandboxError> {
    if !mounts_detached {
        warn!(path = %scratch_dir.display(), "Keeping scratch dir, unmount failed");
        return Err(SandboxError::ScratchKept(scratch_dir.to_path_buf()));
    }
    match fs::remove_dir_all(scratch_dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(SandboxError::io(scratch_dir, e)),
        _ => Ok(()),
    }
}

fn restore_root(host_root: &fs::File, orig_pwd: &Path) -> Result<(), SandboxError> {
    let restore = |step: &'static str| {
        move |source: io::Error| SandboxError::Restore { step, source }
    };

    // SAFETY: fchdir on a descriptor we own; no memory is involved.
    if unsafe { libc::fchdir(host_root.as_raw_fd()) } != 0 {
        return Err(restore("fchdir")(io::Error::last_os_error()));
    }
    chroot(".").map_err(|e| restore("chroot")(e.into()))?;
    chdir(orig_pwd).map_err(|e| restore("chdir")(e.into()))?;
    debug!(cwd = %orig_pwd.display(), "Left chroot");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scratch_kept_when_unmount_failed() {
        let tmp = TempDir::new().unwrap();
        let scratch = tmp.path().join("layer.scratch");
        fs::create_dir_all(scratch.join("chroot/proc")).unwrap();
        fs::write(scratch.join("chroot/proc/stat"), "host data").unwrap();

        let err = remove_scratch(&scratch, false).unwrap_err();
        assert!(matches!(err, SandboxError::ScratchKept(ref p) if *p == scratch));
        assert!(scratch.join("chroot/proc/stat").exists());

        remove_scratch(&scratch, true).unwrap();
        assert!(!scratch.exists());
        // Already gone is fine.
        remove_scratch(&scratch, true).unwrap();
    }

    #[test]
    fn test_failed_unmount_step_blocks_scratch_removal() {
        let tmp = TempDir::new().unwrap();
        let scratch = tmp.path().join("layer.scratch");
        let not_mounted = scratch.join("chroot");
        fs::create_dir_all(&not_mounted).unwrap();

        let detach_failed = Rc::new(Cell::new(false));
        let mut undo = UndoStack::new();
        {
            let scratch = scratch.clone();
            let detach_failed = detach_failed.clone();
            undo.push(move || remove_scratch(&scratch, !detach_failed.get()));
        }
        // Detaching a plain directory fails (EINVAL, or EPERM unprivileged).
        push_unmount(&mut undo, &detach_failed, not_mounted.clone());

        let errors = undo.unwind();
        assert!(detach_failed.get());
        assert_eq!(errors.len(), 2);
        assert!(matches!(&errors[0], SandboxError::Unmount { .. }));
        assert!(matches!(&errors[1], SandboxError::ScratchKept(_)));
        assert!(not_mounted.exists());
    }
}
