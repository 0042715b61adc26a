//! Collaborators shared by every conversation and executor in one run.

use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use crate::io::config::PilotConfig;
use crate::io::human::HumanInput;
use crate::io::interrupt::Interrupt;
use crate::io::llm::LlmClient;
use crate::io::process::ProcessRunner;
use crate::io::prompt::PromptEngine;
use crate::io::store::{ProjectStore, RecordKind};

/// Borrowed view of the run's dependencies.
///
/// Copying a session is cheap; the owner (the CLI or a test harness) keeps the
/// collaborators alive for the duration of the run.
#[derive(Clone, Copy)]
pub struct Session<'a> {
    pub config: &'a PilotConfig,
    pub llm: &'a dyn LlmClient,
    pub prompts: &'a PromptEngine,
    pub human: &'a dyn HumanInput,
    pub store: &'a dyn ProjectStore,
    pub processes: &'a ProcessRunner,
    pub interrupt: &'a Interrupt,
    /// Directory commands run in and code changes are written under.
    pub project_root: &'a Path,
    pub app_id: &'a str,
}

impl Session<'_> {
    pub fn record_step(&self, kind: RecordKind, payload: &Value) -> Result<()> {
        self.store.record_step(self.app_id, kind, payload)
    }
}
