//! Project file access: safe writes and "current file contents" context blocks.
//!
//! File contents injected into a conversation are wrapped as
//! `<file path="REL" lines="N">\nCONTENT\n</file>` so they can be located and
//! refreshed later when an older transcript is restored. The line count marks
//! where the content ends, so file text that itself contains `</file>` does
//! not cut a block short.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::{Captures, Regex};
use tracing::{debug, warn};

/// Placeholder content for a file that no longer exists.
pub const DELETED_MARKER: &str = "[file deleted]";

const CLOSING_TAG: &str = "</file>";

static FILE_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<file path="([^"]+)" lines="(\d+)">\n"#).expect("file header regex")
});

/// A file's contents at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    pub path: String,
    /// `None` when the file does not exist.
    pub content: Option<String>,
}

/// Resolve `relative` under `root`, rejecting absolute paths and `..` segments.
pub fn resolve_in_root(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if relative.trim().is_empty() {
        return Err(anyhow!("empty file path"));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(anyhow!("path escapes project root: {relative}")),
        }
    }
    Ok(root.join(rel))
}

pub fn read_snapshot(root: &Path, relative: &str) -> Result<FileSnapshot> {
    let path = resolve_in_root(root, relative)?;
    let content = if path.is_file() {
        Some(fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?)
    } else {
        None
    };
    Ok(FileSnapshot {
        path: relative.to_string(),
        content,
    })
}

/// Write full file contents under `root`, creating parent directories.
pub fn write_file(root: &Path, relative: &str, content: &str) -> Result<PathBuf> {
    let path = resolve_in_root(root, relative)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
    debug!(path = %path.display(), bytes = content.len(), "wrote file");
    Ok(path)
}

/// Atomically replace `path` (temp file + rename).
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

pub fn render_file_block(snapshot: &FileSnapshot) -> String {
    let content = snapshot.content.as_deref().unwrap_or(DELETED_MARKER);
    format!(
        "<file path=\"{}\" lines=\"{}\">\n{content}\n{CLOSING_TAG}",
        snapshot.path,
        content.split('\n').count()
    )
}

/// Snapshot and render every path in order, separated by blank lines.
///
/// Paths that cannot be resolved or read as text are left out.
pub fn render_file_blocks(root: &Path, paths: &[String]) -> String {
    let mut blocks = Vec::with_capacity(paths.len());
    for path in paths {
        match read_snapshot(root, path) {
            Ok(snapshot) => blocks.push(render_file_block(&snapshot)),
            Err(e) => warn!(path = %path, err = %e, "leaving file out of context"),
        }
    }
    blocks.join("\n\n")
}

/// True when `text` carries at least one file block.
pub fn has_file_blocks(text: &str) -> bool {
    FILE_HEADER_RE
        .captures_iter(text)
        .any(|caps| block_end(text, &caps).is_some())
}

/// Byte offset just past the closing tag of the block whose header is `caps`.
fn block_end(text: &str, caps: &Captures<'_>) -> Option<usize> {
    let lines: usize = caps[2].parse().ok()?;
    let mut pos = caps.get(0)?.end();
    for _ in 0..lines {
        pos += text[pos..].find('\n')? + 1;
    }
    text[pos..]
        .starts_with(CLOSING_TAG)
        .then_some(pos + CLOSING_TAG.len())
}

/// Replace the content of every file block in `text` with the live file.
///
/// Blocks whose path cannot be read (or resolved) are left untouched.
pub fn refresh_file_blocks(root: &Path, text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(caps) = FILE_HEADER_RE.captures(rest) {
        let Some(header) = caps.get(0) else { break };
        let Some(end) = block_end(rest, &caps) else {
            out.push_str(&rest[..header.end()]);
            rest = &rest[header.end()..];
            continue;
        };
        out.push_str(&rest[..header.start()]);
        let path = &caps[1];
        match read_snapshot(root, path) {
            Ok(snapshot) => out.push_str(&render_file_block(&snapshot)),
            Err(e) => {
                debug!(path, err = %e, "keeping stale file block");
                out.push_str(&rest[header.start()..end]);
            }
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}
