//! Deterministic, pure logic shared by the pilot core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod answers;
pub mod functions;
pub mod recursion;
pub mod steps;
pub mod timeouts;
pub mod tokens;
pub mod types;
pub mod verdict;
