//! Scripted collaborators and a harness that assembles a [`Session`] for tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::path::Path;

use anyhow::{Result, anyhow, bail};
use serde_json::Value;
use tempfile::TempDir;

use crate::core::types::Message;
use crate::error::LlmError;
use crate::io::config::{ConfirmPolicy, PilotConfig};
use crate::io::human::{HumanInput, match_allowed};
use crate::io::interrupt::Interrupt;
use crate::io::llm::{CompletionRequest, LlmClient, LlmResponse};
use crate::io::process::ProcessRunner;
use crate::io::prompt::PromptEngine;
use crate::io::store::{AppRecord, AppSummary, ProjectStore, RecordKind};
use crate::session::Session;

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Call { name: String, arguments: String },
    TokenLimit,
    ApiError(String),
}

/// What a scripted client was asked.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    /// Name of the forced function, if any.
    pub function: Option<String>,
}

/// LLM client that pops replies from a queue. An empty queue is an error.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    replies: RefCell<VecDeque<ScriptedReply>>,
    requests: RefCell<Vec<RecordedRequest>>,
}

impl ScriptedLlm {
    pub fn push_text(&self, text: &str) {
        self.replies
            .borrow_mut()
            .push_back(ScriptedReply::Text(text.to_string()));
    }

    pub fn push_call(&self, name: &str, arguments: &Value) {
        self.replies.borrow_mut().push_back(ScriptedReply::Call {
            name: name.to_string(),
            arguments: arguments.to_string(),
        });
    }

    /// Queue a JSON object sent back as plain text.
    pub fn push_json(&self, value: &Value) {
        self.push_text(&value.to_string());
    }

    pub fn push_token_limit(&self) {
        self.replies.borrow_mut().push_back(ScriptedReply::TokenLimit);
    }

    pub fn push_api_error(&self, message: &str) {
        self.replies
            .borrow_mut()
            .push_back(ScriptedReply::ApiError(message.to_string()));
    }

    pub fn call_count(&self) -> usize {
        self.requests.borrow().len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl LlmClient for ScriptedLlm {
    fn complete(&self, request: &CompletionRequest<'_>) -> Result<LlmResponse> {
        self.requests.borrow_mut().push(RecordedRequest {
            messages: request.messages.to_vec(),
            function: request
                .functions
                .and_then(|set| set.primary())
                .map(|def| def.name.clone()),
        });
        let reply = self
            .replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted LLM has no reply left"))?;
        match reply {
            ScriptedReply::Text(text) => Ok(LlmResponse::Text(text)),
            ScriptedReply::Call { name, arguments } => {
                Ok(LlmResponse::FunctionCall { name, arguments })
            }
            ScriptedReply::TokenLimit => Err(LlmError::TokenLimit {
                estimated: 9000,
                limit: 8192,
            }
            .into()),
            ScriptedReply::ApiError(message) => Err(LlmError::Api(message).into()),
        }
    }
}

/// Human that answers from a queue; an empty queue answers with ENTER.
#[derive(Debug, Default)]
pub struct ScriptedHuman {
    answers: RefCell<VecDeque<String>>,
    questions: RefCell<Vec<String>>,
}

impl ScriptedHuman {
    pub fn push_answer(&self, answer: &str) {
        self.answers.borrow_mut().push_back(answer.to_string());
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.borrow().clone()
    }
}

impl HumanInput for ScriptedHuman {
    fn ask(&self, question: &str, allowed_answers: Option<&[&str]>) -> Result<String> {
        self.questions.borrow_mut().push(question.to_string());
        let answer = self.answers.borrow_mut().pop_front().unwrap_or_default();
        match allowed_answers {
            None => Ok(answer),
            Some(allowed) => match match_allowed(&answer, allowed) {
                Some(choice) => Ok(choice.to_string()),
                None => bail!("scripted answer {answer:?} is not one of {allowed:?}"),
            },
        }
    }
}

/// In-memory [`ProjectStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    steps: RefCell<Vec<(RecordKind, Value)>>,
    command_runs: RefCell<Vec<(String, Option<String>, Option<i32>)>>,
    apps: RefCell<HashMap<String, AppRecord>>,
}

impl MemoryStore {
    pub fn steps_of(&self, kind: RecordKind) -> Vec<Value> {
        self.steps
            .borrow()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// `(command, output, exit_code)` per recorded run.
    pub fn command_runs(&self) -> Vec<(String, Option<String>, Option<i32>)> {
        self.command_runs.borrow().clone()
    }
}

impl ProjectStore for MemoryStore {
    fn record_step(&self, _app_id: &str, kind: RecordKind, payload: &Value) -> Result<()> {
        self.steps.borrow_mut().push((kind, payload.clone()));
        Ok(())
    }

    fn record_command_run(
        &self,
        _app_id: &str,
        command: &str,
        output: Option<&str>,
        exit_code: Option<i32>,
    ) -> Result<()> {
        self.command_runs.borrow_mut().push((
            command.to_string(),
            output.map(str::to_string),
            exit_code,
        ));
        Ok(())
    }

    fn get_app(&self, app_id: &str) -> Result<Option<AppRecord>> {
        Ok(self.apps.borrow().get(app_id).cloned())
    }

    fn save_app(&self, app: &AppRecord) -> Result<()> {
        self.apps.borrow_mut().insert(app.id.clone(), app.clone());
        Ok(())
    }

    fn list_apps(&self) -> Result<Vec<AppSummary>> {
        let steps = self.steps.borrow().len();
        let mut apps: Vec<AppSummary> = self
            .apps
            .borrow()
            .values()
            .map(|app| AppSummary {
                id: app.id.clone(),
                name: app.name.clone(),
                status: app.status,
                created_at: app.created_at,
                step_count: steps,
            })
            .collect();
        apps.sort_by_key(|app| app.created_at);
        Ok(apps)
    }
}

/// Owns every collaborator a [`Session`] borrows, plus a temporary project root.
pub struct TestHarness {
    pub config: PilotConfig,
    pub llm: ScriptedLlm,
    pub human: ScriptedHuman,
    pub store: MemoryStore,
    pub processes: ProcessRunner,
    pub interrupt: Interrupt,
    pub prompts: PromptEngine,
    pub app_id: String,
    dir: TempDir,
}

impl TestHarness {
    /// Fast limits, no confirmations and a short kill grace.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut PilotConfig)) -> Self {
        let mut config = PilotConfig {
            min_command_run_time_ms: 0,
            max_command_run_time_ms: 10_000,
            terminate_grace_ms: 200,
            confirm_commands: ConfirmPolicy::Never,
            ..PilotConfig::default()
        };
        adjust(&mut config);
        let processes = ProcessRunner::new(config.terminate_grace());
        Self {
            config,
            llm: ScriptedLlm::default(),
            human: ScriptedHuman::default(),
            store: MemoryStore::default(),
            processes,
            interrupt: Interrupt::new(),
            prompts: PromptEngine::new().expect("prompt templates"),
            app_id: "test-app".to_string(),
            dir: TempDir::new().expect("temp project dir"),
        }
    }

    pub fn project_root(&self) -> &Path {
        self.dir.path()
    }

    pub fn session(&self) -> Session<'_> {
        Session {
            config: &self.config,
            llm: &self.llm,
            prompts: &self.prompts,
            human: &self.human,
            store: &self.store,
            processes: &self.processes,
            interrupt: &self.interrupt,
            project_root: self.dir.path(),
            app_id: &self.app_id,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.processes.terminate_all();
    }
}
