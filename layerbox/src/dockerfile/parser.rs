use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{BuildFile, Instruction, InstructionKind};
use crate::errors::ParseError;
use crate::hash::hash_strings;

/// Parse a build file given either its content or its path.
///
/// Input containing `FROM ` is treated as content. Anything else is a path,
/// resolved against `ctx_dir` when relative.
pub fn parse(path_or_content: &str, ctx_dir: impl AsRef<Path>) -> Result<BuildFile, ParseError> {
    let ctx_dir = ctx_dir.as_ref();
    if path_or_content.contains("FROM ") {
        return parse_str(path_or_content, ctx_dir);
    }

    let mut path = PathBuf::from(path_or_content);
    if path.is_relative() {
        path = ctx_dir.join(path);
    }
    debug!(path = %path.display(), "Reading build file");
    let content = fs::read_to_string(&path).map_err(|source| ParseError::Read {
        path: path.clone(),
        source,
    })?;
    parse_str(&content, ctx_dir)
}

/// Parse build file content.
pub fn parse_str(content: &str, ctx_dir: impl AsRef<Path>) -> Result<BuildFile, ParseError> {
    let ctx_dir = absolute_ctx_dir(ctx_dir.as_ref())?;
    let raw = split_instructions(content)?;

    let Some(((_, from), rest)) = raw.split_first().filter(|(first, _)| first.0 == "FROM")
    else {
        return Err(ParseError::MissingFrom {
            found: raw
                .first()
                .map(|(k, _)| k.clone())
                .unwrap_or_else(|| "nothing".to_string()),
        });
    };

    let base = from.split('#').next().unwrap_or_default().trim().to_string();
    let ctx = ctx_dir.to_string_lossy().into_owned();

    let mut file = BuildFile {
        base_id: hash_strings(&[base.as_str()]),
        base,
        ctx_dir,
        layers: Vec::new(),
        exposes: Vec::new(),
    };

    let mut work_dir = "/".to_string();
    let mut env: Vec<String> = Vec::new();
    let mut mounts: Vec<String> = Vec::new();

    for (index, (keyword, value)) in rest.iter().enumerate() {
        let kind = match keyword.as_str() {
            "WORKDIR" => {
                work_dir = value.clone();
                continue;
            }
            "ENV" => {
                env.push(value.clone());
                continue;
            }
            "VOLUME" => {
                mounts.push(value.clone());
                continue;
            }
            "EXPOSE" => {
                file.exposes.push(value.clone());
                continue;
            }
            "COPY" => InstructionKind::Copy,
            "RUN" => InstructionKind::Run,
            _ => {
                return Err(ParseError::Unsupported {
                    keyword: keyword.clone(),
                    value: value.clone(),
                });
            }
        };

        let content = serde_json::json!({
            "kind": kind,
            "value": value,
            "work_dir": work_dir,
            "env": env,
            "mounts": mounts,
        })
        .to_string();
        let id = hash_strings(&[
            ctx.as_str(),
            file.base.as_str(),
            index.to_string().as_str(),
            content.as_str(),
        ]);

        file.layers.push(Instruction {
            id,
            kind,
            value: value.clone(),
            work_dir: work_dir.clone(),
            env: env.clone(),
            mounts: mounts.clone(),
        });
    }

    debug!(
        base = %file.base,
        layers = file.layers.len(),
        "Parsed build file"
    );
    Ok(file)
}

/// Split content into `(KEYWORD, value)` pairs.
///
/// Blank lines and `#` comments are skipped. A trailing `\` joins the line
/// with the next one using a single space.
fn split_instructions(content: &str) -> Result<Vec<(String, String)>, ParseError> {
    let mut out = Vec::new();
    let mut pending = String::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(head) = line.strip_suffix('\\') {
            pending.push_str(head);
            pending.push(' ');
            continue;
        }
        pending.push_str(line);
        out.push(split_keyword(&pending)?);
        pending.clear();
    }

    // Continuation on the last line.
    if !pending.trim().is_empty() {
        out.push(split_keyword(&pending)?);
    }
    Ok(out)
}

fn split_keyword(line: &str) -> Result<(String, String), ParseError> {
    let line = line.trim();
    let (keyword, value) = match line.split_once(char::is_whitespace) {
        Some((k, v)) => (k, v.trim()),
        None => (line, ""),
    };
    let keyword = keyword.to_uppercase();
    if value.is_empty() {
        return Err(ParseError::MissingArgument { keyword });
    }
    Ok((keyword, value.to_string()))
}

fn absolute_ctx_dir(ctx_dir: &Path) -> Result<PathBuf, ParseError> {
    let ctx_dir = if ctx_dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        ctx_dir
    };
    let abs = std::path::absolute(ctx_dir).map_err(|source| ParseError::Context {
        path: ctx_dir.to_path_buf(),
        source,
    })?;
    // Drop `.` components so "." and "./" hash the same.
    Ok(abs.components().collect())
}
