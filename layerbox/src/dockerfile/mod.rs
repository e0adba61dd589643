//! Build file model and parser.
//!
//! A build file is a restricted Dockerfile: `FROM`, `WORKDIR`, `ENV`,
//! `VOLUME`, `EXPOSE`, `COPY` and `RUN`. Only `COPY` and `RUN` produce
//! layers; the other instructions update the state snapshotted into every
//! following layer.

mod parser;

pub use parser::{parse, parse_str};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A parsed build file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFile {
    /// Layer id of the base image (hash of `base`).
    pub base_id: String,
    /// Raw base image reference, e.g. `alpine:latest`.
    pub base: String,
    /// Absolute build context directory.
    pub ctx_dir: PathBuf,
    /// Layer-producing instructions, in file order.
    pub layers: Vec<Instruction>,
    /// Ports declared with `EXPOSE`. Informational only.
    pub exposes: Vec<String>,
}

impl BuildFile {
    /// Every layer id this file references, base first.
    pub fn layer_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.base_id.as_str()).chain(self.layers.iter().map(|l| l.id.as_str()))
    }
}

/// One `COPY` or `RUN` instruction with the state in effect at that point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Content-derived layer id.
    pub id: String,
    pub kind: InstructionKind,
    /// Arguments as written (continuations joined).
    pub value: String,
    pub work_dir: String,
    /// `ENV` values declared above this instruction.
    pub env: Vec<String>,
    /// `VOLUME` bind specs declared above this instruction.
    pub mounts: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstructionKind {
    Copy,
    Run,
}

impl InstructionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionKind::Copy => "COPY",
            InstructionKind::Run => "RUN",
        }
    }
}

impl fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.value)
    }
}
