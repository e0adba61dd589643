//! Re-exec into user/mount/pid namespaces and UID/GID mapping handshake.
//!
//! The parent clones `/proc/self/exe` into fresh namespaces with SIGUSR1
//! blocked, installs the child's ID mappings and then sends SIGUSR1. The
//! child waits for that signal before doing anything that needs root.

use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::process::Command;
use std::time::Duration;

use caps::CapSet;
use nix::sched::{CloneFlags, clone};
use nix::sys::signal::{SigSet, SigmaskHow, Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{Gid, Pid, Uid, execve};
use tracing::{debug, warn};

use crate::constants::envs::REEXEC_MARKER;
use crate::constants::sandbox::{SUBID_COUNT, SUBID_START};
use crate::errors::SandboxError;

const CHILD_STACK_SIZE: usize = 1024 * 1024;

// ============================================================================
// ID Mapping
// ============================================================================

/// Installs UID/GID mappings for a child in a new user namespace.
pub trait IdMapper {
    fn map_ids(&self, pid: Pid, uid: Uid, gid: Gid) -> Result<(), SandboxError>;
}

/// Maps through the setuid `newuidmap`/`newgidmap` helpers.
///
/// The caller becomes root in the child; the subordinate range from
/// `/etc/subuid` and `/etc/subgid` fills IDs `1..=count`.
#[derive(Clone, Debug)]
pub struct NewIdMap {
    pub subid_start: u32,
    pub subid_count: u32,
}

impl Default for NewIdMap {
    fn default() -> Self {
        Self {
            subid_start: SUBID_START,
            subid_count: SUBID_COUNT,
        }
    }
}

impl NewIdMap {
    fn run(&self, helper: &str, pid: Pid, id: u32) -> Result<(), SandboxError> {
        let args = [
            pid.to_string(),
            "0".into(),
            id.to_string(),
            "1".into(),
            "1".into(),
            self.subid_start.to_string(),
            self.subid_count.to_string(),
        ];
        debug!("{} {}", helper, args.join(" "));

        let status = Command::new(helper)
            .args(&args)
            .status()
            .map_err(|e| SandboxError::IdMapping(format!("failed to run {helper}: {e}")))?;
        if !status.success() {
            return Err(SandboxError::IdMapping(format!("{helper} {status}")));
        }
        Ok(())
    }
}

impl IdMapper for NewIdMap {
    fn map_ids(&self, pid: Pid, uid: Uid, gid: Gid) -> Result<(), SandboxError> {
        self.run("newuidmap", pid, uid.as_raw())?;
        self.run("newgidmap", pid, gid.as_raw())
    }
}

/// Writes `/proc/<pid>/{uid,gid}_map` directly. Needs real root.
#[derive(Clone, Debug)]
pub struct ProcIdMap {
    pub count: u32,
}

impl Default for ProcIdMap {
    fn default() -> Self {
        Self { count: SUBID_COUNT }
    }
}

impl IdMapper for ProcIdMap {
    fn map_ids(&self, pid: Pid, uid: Uid, gid: Gid) -> Result<(), SandboxError> {
        for (file, id) in [("uid_map", uid.as_raw()), ("gid_map", gid.as_raw())] {
            let path = format!("/proc/{pid}/{file}");
            fs::write(&path, format!("0 {} {}\n", id, self.count))
                .map_err(|e| SandboxError::IdMapping(format!("write {path}: {e}")))?;
        }
        Ok(())
    }
}

/// The mapper matching the calling user: direct writes for root,
/// `newuidmap`/`newgidmap` otherwise.
pub fn host_id_mapper() -> Box<dyn IdMapper> {
    if Uid::current().is_root() {
        Box::new(ProcIdMap::default())
    } else {
        Box::new(NewIdMap::default())
    }
}

// ============================================================================
// Re-exec
// ============================================================================

/// Re-run the current binary inside new user, mount and pid namespaces.
///
/// In the parent this returns `Ok(None)` once the child exited successfully
/// (a failing child is [`SandboxError::ChildExited`]). In the re-executed
/// child it waits for the ID mapping and returns `Ok(Some(marker))`.
///
/// Must be called before the process starts any thread.
pub fn reexec_namespaced(
    marker: &str,
    mapper: &dyn IdMapper,
    id_map_timeout: Duration,
) -> Result<Option<String>, SandboxError> {
    if let Some(value) = std::env::var_os(REEXEC_MARKER).filter(|v| !v.is_empty()) {
        await_id_mapping(id_map_timeout)?;
        return Ok(Some(value.to_string_lossy().into_owned()));
    }

    let marker = if marker.is_empty() { "1" } else { marker };
    let exe = c"/proc/self/exe";
    let args = std::env::args_os()
        .map(|a| CString::new(a.into_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(invalid_input("argv"))?;
    let mut env = std::env::vars_os()
        .filter(|(k, _)| k != REEXEC_MARKER)
        .map(|(k, v)| {
            let mut kv = k.into_vec();
            kv.push(b'=');
            kv.extend(v.into_vec());
            CString::new(kv)
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(invalid_input("environment"))?;
    env.push(CString::new(format!("{REEXEC_MARKER}={marker}")).map_err(invalid_input("marker"))?);

    let (uid, gid) = (Uid::current(), Gid::current());
    let flags = CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID;
    let mut stack = vec![0u8; CHILD_STACK_SIZE];

    // The child inherits the blocked mask, so an early SIGUSR1 stays pending.
    let mut usr1 = SigSet::empty();
    usr1.add(Signal::SIGUSR1);
    let old_mask = usr1
        .thread_swap_mask(SigmaskHow::SIG_BLOCK)
        .map_err(namespace_err("sigprocmask"))?;

    // SAFETY: the process is single threaded and the callback only raises
    // capabilities and execs.
    let cloned = unsafe {
        clone(
            Box::new(|| exec_child(exe, &args, &env)),
            &mut stack,
            flags,
            Some(Signal::SIGCHLD as libc::c_int),
        )
    };
    let restored = old_mask.thread_set_mask();
    let pid = cloned.map_err(namespace_err("clone"))?;
    restored.map_err(namespace_err("sigprocmask"))?;
    debug!(%pid, "Started namespaced child");

    if let Err(e) = mapper.map_ids(pid, uid, gid) {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = wait_child(pid);
        return Err(e);
    }
    if let Err(e) = kill(pid, Signal::SIGUSR1) {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = wait_child(pid);
        return Err(namespace_err("signal child")(e));
    }

    match wait_child(pid)? {
        0 => Ok(None),
        code => Err(SandboxError::ChildExited { code }),
    }
}

/// Block until the parent has installed our UID/GID mapping.
///
/// Returns at once when already uid/gid 0. Otherwise waits for SIGUSR1 at
/// most `timeout`.
pub fn await_id_mapping(timeout: Duration) -> Result<(), SandboxError> {
    if is_mapped_root() {
        return Ok(());
    }

    let mut usr1 = SigSet::empty();
    usr1.add(Signal::SIGUSR1);
    usr1.thread_block().map_err(namespace_err("sigprocmask"))?;

    let deadline = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    loop {
        // SAFETY: valid sigset and timespec; siginfo is optional.
        let rc = unsafe { libc::sigtimedwait(usr1.as_ref(), std::ptr::null_mut(), &deadline) };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => {
                return Err(SandboxError::IdMapTimeout {
                    secs: timeout.as_secs(),
                });
            }
            _ => {
                return Err(SandboxError::Namespace {
                    op: "sigtimedwait",
                    source: err,
                });
            }
        }
    }

    if !is_mapped_root() {
        return Err(SandboxError::NotMapped {
            uid: Uid::current().as_raw(),
            gid: Gid::current().as_raw(),
        });
    }
    Ok(())
}

fn is_mapped_root() -> bool {
    Uid::current().is_root() && Gid::current().as_raw() == 0
}

/// Runs in the cloned child: keep every capability across exec, then exec.
fn exec_child(exe: &CStr, args: &[CString], env: &[CString]) -> isize {
    let all = caps::runtime::thread_all_supported();
    if caps::set(None, CapSet::Inheritable, &all).is_ok() {
        for cap in all {
            let _ = caps::raise(None, CapSet::Ambient, cap);
        }
    }
    let _ = execve(exe, args, env);
    127
}

/// Wait for `pid`, mapping its end state to a shell-style exit code.
fn wait_child(pid: Pid) -> Result<i32, SandboxError> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                warn!(%pid, ?signal, "Namespaced child killed");
                return Ok(128 + signal as i32);
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(namespace_err("waitpid")(e)),
        }
    }
}

fn namespace_err(op: &'static str) -> impl Fn(nix::errno::Errno) -> SandboxError {
    move |e| SandboxError::Namespace {
        op,
        source: e.into(),
    }
}

fn invalid_input(what: &'static str) -> impl Fn(std::ffi::NulError) -> SandboxError {
    move |e| SandboxError::Namespace {
        op: what,
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingMapper(Mutex<Vec<(i32, u32, u32)>>);

    impl IdMapper for RecordingMapper {
        fn map_ids(&self, pid: Pid, uid: Uid, gid: Gid) -> Result<(), SandboxError> {
            self.0
                .lock()
                .unwrap()
                .push((pid.as_raw(), uid.as_raw(), gid.as_raw()));
            Ok(())
        }
    }

    #[test]
    fn test_mapper_trait_is_object_safe() {
        let mapper = RecordingMapper(Mutex::new(Vec::new()));
        let dyn_mapper: &dyn IdMapper = &mapper;
        dyn_mapper
            .map_ids(Pid::from_raw(42), Uid::from_raw(1000), Gid::from_raw(1000))
            .unwrap();
        assert_eq!(*mapper.0.lock().unwrap(), vec![(42, 1000, 1000)]);
    }

    #[test]
    fn test_newidmap_missing_helper_reports_mapping_error() {
        let err = NewIdMap::default()
            .run("layerbox-no-such-helper", Pid::from_raw(1), 1000)
            .unwrap_err();
        assert!(matches!(err, SandboxError::IdMapping(_)));
    }

    #[test]
    fn test_await_id_mapping_times_out_when_unmapped() {
        if is_mapped_root() {
            return;
        }
        let err = await_id_mapping(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, SandboxError::IdMapTimeout { .. }));
    }
}
