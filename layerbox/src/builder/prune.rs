//! Garbage collection of the layer store.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::dockerfile;
use crate::errors::{BuildError, BuildResult};

/// What a prune pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PruneStats {
    pub kept: usize,
    pub removed: Vec<String>,
}

/// Ids of every layer the given build files can produce.
fn live_ids(referenced: &[(String, PathBuf)]) -> BuildResult<HashSet<String>> {
    let mut live = HashSet::new();
    for (file, ctx_dir) in referenced {
        let parsed = dockerfile::parse(file, ctx_dir)?;
        live.extend(parsed.layer_ids().map(str::to_string));
    }
    debug!(count = live.len(), "collected live layer ids");
    Ok(live)
}

/// Delete every entry of `layers_dir` not produced by `referenced`.
///
/// Scratch directories (`<id>.tmp`) are not layers and are always removed.
pub fn prune_layers(
    layers_dir: &Path,
    referenced: &[(String, PathBuf)],
) -> BuildResult<PruneStats> {
    let live = live_ids(referenced)?;
    let mut stats = PruneStats::default();

    let entries = match fs::read_dir(layers_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(stats),
        Err(e) => return Err(BuildError::layer(layers_dir, e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| BuildError::layer(layers_dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if live.contains(&name) {
            stats.kept += 1;
            continue;
        }
        super::layer::remove_if_exists(&entry.path())?;
        debug!(layer = %name, "removed");
        stats.removed.push(name);
    }
    stats.removed.sort();

    info!(
        kept = stats.kept,
        removed = stats.removed.len(),
        "prune complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FILE: &str = "FROM alpine\nRUN echo one\nCOPY a /a\n";

    #[test]
    fn test_prune_keeps_only_referenced_layers() {
        let tmp = TempDir::new().unwrap();
        let layers = tmp.path().join("layers");
        let ctx = tmp.path().join("ctx");
        let parsed = dockerfile::parse_str(FILE, &ctx).unwrap();

        for id in parsed.layer_ids() {
            fs::create_dir_all(layers.join(id)).unwrap();
        }
        fs::create_dir_all(layers.join("stale")).unwrap();
        fs::create_dir_all(layers.join(format!("{}.tmp", parsed.layers[0].id))).unwrap();
        fs::write(layers.join("stray-file"), "x").unwrap();

        let stats = prune_layers(&layers, &[(FILE.to_string(), ctx)]).unwrap();

        assert_eq!(stats.kept, 3);
        assert_eq!(stats.removed.len(), 3);
        for id in parsed.layer_ids() {
            assert!(layers.join(id).is_dir());
        }
        assert!(!layers.join("stale").exists());
        assert!(!layers.join("stray-file").exists());
    }

    #[test]
    fn test_prune_with_no_references_empties_store() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a")).unwrap();
        fs::create_dir_all(tmp.path().join("b")).unwrap();

        let stats = prune_layers(tmp.path(), &[]).unwrap();
        assert_eq!(stats.kept, 0);
        assert_eq!(stats.removed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_prune_missing_store_is_empty() {
        let tmp = TempDir::new().unwrap();
        let stats = prune_layers(&tmp.path().join("nope"), &[]).unwrap();
        assert_eq!(stats, PruneStats::default());
    }

    #[test]
    fn test_prune_rejects_unparsable_reference() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("keep-me")).unwrap();

        let err = prune_layers(
            tmp.path(),
            &[("FROM alpine\nCMD nope\n".to_string(), tmp.path().to_path_buf())],
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::Parse(_)));
        assert!(tmp.path().join("keep-me").exists());
    }
}
