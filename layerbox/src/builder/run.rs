//! RUN instructions and execution backends.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::layer;
use crate::dockerfile::Instruction;
use crate::errors::BuildResult;

/// Executes one RUN instruction.
///
/// `layer_dir` is the writable upper layer (empty on entry); `lower_dirs`
/// is the read-only stack, base first. `binds` are `src[:dst[:ro|rw]]`
/// specs to mount for the duration of the command.
pub trait Runner: Send + Sync {
    fn run(
        &self,
        instruction: &Instruction,
        layer_dir: &Path,
        lower_dirs: &[PathBuf],
        binds: &[String],
    ) -> BuildResult<()>;
}

/// Cache key of a RUN layer: the lower stack joined with `:`.
pub(crate) fn stack_key(lower_dirs: &[PathBuf]) -> String {
    lower_dirs
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

/// Apply a RUN instruction to `layer_dir`. Returns whether it was rebuilt.
///
/// Skipped only when the stored key equals the current lower stack,
/// nothing upstream changed and the instruction declares no mounts. Mounted
/// content cannot be fingerprinted, so any declared mount forces a rerun.
pub(crate) fn run(
    runner: &dyn Runner,
    instruction: &Instruction,
    layer_dir: &Path,
    lower_dirs: &[PathBuf],
    builder_mounts: &[String],
    changed: bool,
) -> BuildResult<bool> {
    let key = stack_key(lower_dirs);
    if !changed && instruction.mounts.is_empty() && layer::read_marker(layer_dir)? == key {
        debug!(id = %instruction.id, "RUN cache hit");
        return Ok(false);
    }

    let scratch = layer::scratch_path(layer_dir);
    layer::recreate_dir(layer_dir)?;
    layer::remove_if_exists(&scratch)?;

    let binds = builder_mounts
        .iter()
        .chain(&instruction.mounts)
        .cloned()
        .collect::<Vec<_>>();
    debug!(id = %instruction.id, lower = lower_dirs.len(), binds = binds.len(), "RUN");

    // On failure the scratch dir may still hold mounts the runner could not
    // detach, so it is only removed after a clean run.
    runner.run(instruction, layer_dir, lower_dirs, &binds)?;
    layer::remove_if_exists(&scratch)?;

    layer::write_marker(layer_dir, &key)?;
    Ok(true)
}

/// Split `ENV` values into key/value pairs (`K=V` or `K V`).
pub(crate) fn env_pairs(env: &[String]) -> Vec<(String, String)> {
    env.iter()
        .filter_map(|e| {
            let e = e.trim();
            let first = e.split(char::is_whitespace).next().unwrap_or_default();
            let pair = if first.contains('=') {
                e.split_once('=')
            } else {
                e.split_once(char::is_whitespace)
            };
            pair.map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
        })
        .collect()
}

// ============================================================================
// Chroot Runner
// ============================================================================

/// Runs instructions with `sh -c` inside the namespace/overlay sandbox.
///
/// The process must already be mapped root in its own namespaces (see
/// [`crate::sandbox::reexec_namespaced`]).
#[cfg(target_os = "linux")]
#[derive(Clone, Copy, Debug, Default)]
pub struct ChrootRunner;

#[cfg(target_os = "linux")]
impl Runner for ChrootRunner {
    fn run(
        &self,
        instruction: &Instruction,
        layer_dir: &Path,
        lower_dirs: &[PathBuf],
        binds: &[String],
    ) -> BuildResult<()> {
        let scratch = layer::scratch_path(layer_dir);
        crate::sandbox::run_in_chroot(lower_dirs, layer_dir, &scratch, binds, || {
            shell(instruction)
        })?;
        Ok(())
    }
}

/// Run the instruction with inherited stdio in its work dir.
#[cfg(target_os = "linux")]
fn shell(instruction: &Instruction) -> BuildResult<()> {
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    use crate::errors::BuildError;

    let work_dir = Path::new(&instruction.work_dir);
    std::fs::create_dir_all(work_dir).map_err(|e| BuildError::layer(work_dir, e))?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&instruction.value)
        .current_dir(work_dir)
        .envs(env_pairs(&instruction.env))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    // SAFETY: only sigemptyset/sigprocmask, both async-signal-safe. The
    // SIGUSR1 block from the ID mapping handshake must not leak into RUN.
    unsafe {
        cmd.pre_exec(|| {
            let mut empty: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut empty);
            if libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let status = cmd.status().map_err(|source| BuildError::Spawn {
        command: instruction.value.clone(),
        source,
    })?;
    if !status.success() {
        return Err(BuildError::Execution {
            command: instruction.value.clone(),
            status,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dockerfile::InstructionKind;
    use crate::errors::BuildError;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Calls(Mutex<Vec<(PathBuf, Vec<PathBuf>, Vec<String>)>>);

    impl Runner for Calls {
        fn run(
            &self,
            _instruction: &Instruction,
            layer_dir: &Path,
            lower_dirs: &[PathBuf],
            binds: &[String],
        ) -> BuildResult<()> {
            std::fs::write(layer_dir.join("out"), "built").unwrap();
            self.0.lock().unwrap().push((
                layer_dir.to_path_buf(),
                lower_dirs.to_vec(),
                binds.to_vec(),
            ));
            Ok(())
        }
    }

    struct Failing;

    impl Runner for Failing {
        fn run(&self, ins: &Instruction, _: &Path, _: &[PathBuf], _: &[String]) -> BuildResult<()> {
            Err(BuildError::InvalidCopy(ins.value.clone()))
        }
    }

    /// Leaves a file in the scratch dir, then fails or succeeds.
    struct ScratchUser {
        fail: bool,
    }

    impl Runner for ScratchUser {
        fn run(&self, ins: &Instruction, layer_dir: &Path, _: &[PathBuf], _: &[String]) -> BuildResult<()> {
            let scratch = layer::scratch_path(layer_dir);
            std::fs::create_dir_all(scratch.join("merged")).unwrap();
            std::fs::write(scratch.join("merged/busy"), "mounted").unwrap();
            if self.fail {
                return Err(BuildError::InvalidCopy(ins.value.clone()));
            }
            Ok(())
        }
    }

    fn instruction(mounts: &[&str]) -> Instruction {
        Instruction {
            id: "run-layer".into(),
            kind: InstructionKind::Run,
            value: "make".into(),
            work_dir: "/".into(),
            env: vec![],
            mounts: mounts.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn test_run_caches_on_lower_stack() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer");
        let lowers = vec![tmp.path().join("base")];
        let runner = Calls::default();
        let ins = instruction(&[]);

        assert!(run(&runner, &ins, &layer, &lowers, &[], false).unwrap());
        assert_eq!(layer::read_marker(&layer).unwrap(), stack_key(&lowers));
        assert!(!run(&runner, &ins, &layer, &lowers, &[], false).unwrap());
        assert!(run(&runner, &ins, &layer, &lowers, &[], true).unwrap());

        let other = vec![tmp.path().join("base"), tmp.path().join("mid")];
        assert!(run(&runner, &ins, &layer, &other, &[], false).unwrap());
        assert_eq!(runner.0.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_declared_mounts_always_rerun_with_builder_mounts_first() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer");
        let lowers = vec![tmp.path().join("base")];
        let runner = Calls::default();
        let ins = instruction(&["/cache:/cache:rw"]);
        let builder_mounts = vec!["/srv".to_string()];

        assert!(run(&runner, &ins, &layer, &lowers, &builder_mounts, false).unwrap());
        assert!(run(&runner, &ins, &layer, &lowers, &builder_mounts, false).unwrap());

        let calls = runner.0.lock().unwrap();
        assert_eq!(calls[0].2, vec!["/srv", "/cache:/cache:rw"]);
    }

    #[test]
    fn test_failed_run_leaves_no_marker() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer");
        let lowers = vec![tmp.path().join("base")];
        layer::recreate_dir(&layer).unwrap();
        layer::write_marker(&layer, "stale").unwrap();

        assert!(run(&Failing, &instruction(&[]), &layer, &lowers, &[], false).is_err());
        assert_eq!(layer::read_marker(&layer).unwrap(), "");
        assert!(!layer::scratch_path(&layer).exists());
    }

    #[test]
    fn test_scratch_is_kept_after_failed_run() {
        let tmp = TempDir::new().unwrap();
        let layer = tmp.path().join("layer");
        let lowers = vec![tmp.path().join("base")];
        let scratch = layer::scratch_path(&layer);

        let failing = ScratchUser { fail: true };
        assert!(run(&failing, &instruction(&[]), &layer, &lowers, &[], false).is_err());
        assert!(scratch.join("merged/busy").exists());

        // The next attempt starts from a fresh scratch dir and cleans up.
        let ok = ScratchUser { fail: false };
        assert!(run(&ok, &instruction(&[]), &layer, &lowers, &[], false).unwrap());
        assert!(!scratch.exists());
    }

    #[test]
    fn test_env_pairs() {
        let env = vec![
            "A=1".to_string(),
            "B two words".to_string(),
            "C=x=y".to_string(),
            "D x=y".to_string(),
            "=bad".to_string(),
        ];
        assert_eq!(
            env_pairs(&env),
            vec![
                ("A".into(), "1".into()),
                ("B".into(), "two words".into()),
                ("C".into(), "x=y".into()),
                ("D".into(), "x=y".into()),
            ]
        );
    }
}
