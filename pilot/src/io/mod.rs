//! Side-effecting adapters: processes, LLM transport, prompts, persistence.

pub mod config;
pub mod files;
pub mod human;
pub mod interrupt;
pub mod llm;
pub mod process;
pub mod prompt;
pub mod store;
