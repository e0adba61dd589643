#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

pub struct TestContext {
    pub cmd: Command,
    pub layers_dir: PathBuf,
    pub ctx_dir: PathBuf,
    _tmp: TempDir,
}

impl TestContext {
    /// Another invocation against the same layer store.
    pub fn new_cmd(&self) -> Command {
        command(&self.layers_dir)
    }

    /// Write `content` as `name` in the build context.
    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.ctx_dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }
}

fn command(layers_dir: &Path) -> Command {
    let bin_path = env!("CARGO_BIN_EXE_layerbox");
    let mut cmd = Command::new(bin_path);
    cmd.timeout(Duration::from_secs(30));
    cmd.env_remove("LAYERBOX_REGISTRY_TTL");
    cmd.env_remove("RUST_LOG");
    cmd.arg("--layers-dir").arg(layers_dir);
    cmd
}

/// Fresh layer store and build context, removed when the context drops.
pub fn layerbox() -> TestContext {
    let tmp = TempDir::new().unwrap();
    let layers_dir = tmp.path().join("layers");
    let ctx_dir = tmp.path().join("ctx");
    std::fs::create_dir_all(&ctx_dir).unwrap();

    TestContext {
        cmd: command(&layers_dir),
        layers_dir,
        ctx_dir,
        _tmp: tmp,
    }
}
