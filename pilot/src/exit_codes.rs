//! Stable exit codes for the pilot CLI.

/// The run finished (or the requested listing was printed).
pub const OK: i32 = 0;
/// Internal error, bad configuration or an unrecoverable LLM failure.
pub const ERROR: i32 = 1;
/// The model context overflowed and could not be recovered.
pub const TOKEN_LIMIT: i32 = 2;
/// Stopped by Ctrl-C.
pub const INTERRUPTED: i32 = 130;
