//! Heuristic classification of command output.
//!
//! These rules decide whether the model needs to be consulted at all. Only a
//! clean exit with no error-looking text is accepted without judgement.

use std::sync::LazyLock;

use regex::Regex;

static ERROR_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)(^\s*(error|fatal|traceback|exception)\b|\bnpm err!|panicked at|segmentation fault|command not found|no such file or directory|\bunhandled\b)",
    )
    .expect("error text regex")
});

static DESTRUCTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\brm\s+(-[a-z]*r[a-z]*f|-[a-z]*f[a-z]*r)\b|\bmkfs(\.\w+)?\b|\bdd\s+if=|\bgit\s+reset\s+--hard\b|\bgit\s+clean\s+-[a-z]*f|\bdrop\s+(table|database)\b|\bshutdown\b|\breboot\b|\bchmod\s+-R\s+777\s+/|:\(\)\s*\{\s*:\|:&\s*\};:)",
    )
    .expect("destructive command regex")
});

/// Result of the output heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputClass {
    /// Clean exit and nothing that looks like an error.
    Success,
    /// Non-zero exit, no exit code, or error-looking output.
    NeedsJudgment,
}

pub fn classify_output(exit_code: Option<i32>, stdout: &str, stderr: &str) -> OutputClass {
    if exit_code != Some(0) {
        return OutputClass::NeedsJudgment;
    }
    if ERROR_TEXT_RE.is_match(stdout) || ERROR_TEXT_RE.is_match(stderr) {
        return OutputClass::NeedsJudgment;
    }
    OutputClass::Success
}

/// True when a command could destroy data or take the machine down.
pub fn looks_destructive(command: &str) -> bool {
    DESTRUCTIVE_RE.is_match(command)
}

fn head_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Build the CLI response shown to the model.
///
/// stderr keeps its first `max_len` chars, stdout keeps its last `max_len` chars.
pub fn format_cli_response(stdout: &str, stderr: &str, max_len: usize) -> String {
    let mut out = String::new();
    let stderr = stderr.trim_end();
    if !stderr.is_empty() {
        out.push_str("stderr:\n```\n");
        out.push_str(head_chars(stderr, max_len));
        out.push_str("\n```\n");
    }
    out.push_str("stdout:\n```\n");
    out.push_str(tail_chars(stdout.trim_end(), max_len));
    out.push_str("\n```");
    out
}
