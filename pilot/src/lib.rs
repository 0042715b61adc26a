//! LLM-guided development assistant core.
//!
//! A model plans an app as a list of steps (shell commands, whole-file code
//! changes, manual actions); the steps are executed, their output is judged,
//! and failures are handed to a bounded, branch-rewinding repair loop.
//!
//! - **[`core`]**: pure logic (step model, verdicts, token and time budgets,
//!   recursion bookkeeping). No I/O.
//! - **[`io`]**: side effects (processes, LLM HTTP, prompts, files, the
//!   project store, the terminal). Each sits behind a trait or a small type
//!   so tests can substitute it.
//!
//! Orchestration: [`conversation`] (role-bound transcript with branches),
//! [`command`] (run + classify one command), [`developer`] (task step
//! executor), [`debugger`] (repair loop) and [`flow`] (CLI-level flows).

pub mod command;
pub mod conversation;
pub mod core;
pub mod debugger;
pub mod developer;
pub mod error;
pub mod exit_codes;
pub mod flow;
pub mod io;
pub mod logging;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
