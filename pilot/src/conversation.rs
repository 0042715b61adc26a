//! Role-bound LLM conversation with branches, truncation and token accounting.
//!
//! The transcript only ever holds completed exchanges: a user prompt is kept
//! only when the model answered it (and, for structured replies, when the
//! answer parsed). Branches are deep copies keyed by name; restoring one
//! replaces the live transcript wholesale and leaves the branch reusable.

use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::functions::FunctionSet;
use crate::core::types::{AgentRole, Message, PromptTemplate};
use crate::error::LlmError;
use crate::io::files::{has_file_blocks, refresh_file_blocks};
use crate::io::llm::{CompletionRequest, LlmResponse};
use crate::io::store::RecordKind;
use crate::session::Session;

pub struct Conversation<'a> {
    session: Session<'a>,
    role: AgentRole,
    messages: Vec<Message>,
    branches: HashMap<String, Vec<Message>>,
}

impl<'a> Conversation<'a> {
    /// Start a transcript holding only the role's system prompt.
    pub fn new(session: Session<'a>, role: AgentRole) -> Result<Self> {
        let system = session
            .prompts
            .render(role.system_template(), &json!({}))
            .with_context(|| format!("render system prompt for {}", role.as_str()))?;
        Ok(Self {
            session,
            role,
            messages: vec![Message::system(system)],
            branches: HashMap::new(),
        })
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn session(&self) -> Session<'a> {
        self.session
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn branch(&self, name: &str) -> Option<&[Message]> {
        self.branches.get(name).map(Vec::as_slice)
    }

    pub fn branch_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.branches.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Render `template`, send it, and return the reply.
    ///
    /// Without `functions` the reply is returned as a JSON string. With
    /// `functions` the reply must parse and validate against the primary
    /// function schema; one corrective re-ask is made before failing with
    /// [`LlmError::MalformedResponse`]. Oversized requests fail with
    /// [`LlmError::TokenLimit`] before anything is sent.
    #[instrument(skip_all, fields(template = template.name(), role = self.role.as_str()))]
    pub fn send<S: Serialize>(
        &mut self,
        template: PromptTemplate,
        data: &S,
        functions: Option<&FunctionSet>,
    ) -> Result<Value> {
        let prompt = self.session.prompts.render(template, data)?;
        self.messages.push(Message::user(prompt));

        match self.exchange(functions) {
            Ok((reply_text, parsed)) => {
                self.messages.push(Message::assistant(reply_text.clone()));
                let prompt_data = serde_json::to_value(data).unwrap_or(Value::Null);
                self.session.record_step(
                    RecordKind::Development,
                    &json!({
                        "role": self.role.as_str(),
                        "template": template.name(),
                        "prompt_data": prompt_data,
                        "messages": self.messages,
                        "llm_response": reply_text,
                    }),
                )?;
                Ok(parsed)
            }
            Err(err) => {
                // Drop the provisional prompt so the transcript stays consistent.
                self.messages.pop();
                Err(err)
            }
        }
    }

    /// [`send`](Self::send) and deserialize the structured reply.
    pub fn send_as<T: DeserializeOwned, S: Serialize>(
        &mut self,
        template: PromptTemplate,
        data: &S,
        functions: &FunctionSet,
    ) -> Result<T> {
        let value = self.send(template, data, Some(functions))?;
        serde_json::from_value(value)
            .map_err(|e| LlmError::MalformedResponse(format!("{}: {e}", template.name())).into())
    }

    /// [`send`](Self::send) expecting free text.
    pub fn send_text<S: Serialize>(&mut self, template: PromptTemplate, data: &S) -> Result<String> {
        match self.send(template, data, None)? {
            Value::String(text) => Ok(text),
            other => Ok(other.to_string()),
        }
    }

    /// Call the model for the pending prompt, re-asking once on a malformed structured reply.
    fn exchange(&self, functions: Option<&FunctionSet>) -> Result<(String, Value)> {
        let first = self.complete(&self.messages, functions)?;
        let Some(set) = functions else {
            let text = first.transcript_text().to_string();
            return Ok((text.clone(), Value::String(text)));
        };

        let problem = match parse_structured(&first, set) {
            Ok(value) => return Ok((first.transcript_text().to_string(), value)),
            Err(problem) => problem,
        };
        warn!(problem = %problem, "malformed structured reply, asking again");

        let mut transient = self.messages.clone();
        transient.push(Message::assistant(first.transcript_text()));
        transient.push(Message::user(format!(
            "Your last response could not be used: {problem}\nRespond again with only a JSON object that matches the required schema."
        )));
        let second = self.complete(&transient, functions)?;
        match parse_structured(&second, set) {
            Ok(value) => Ok((second.transcript_text().to_string(), value)),
            Err(problem) => Err(LlmError::MalformedResponse(problem).into()),
        }
    }

    fn complete(
        &self,
        messages: &[Message],
        functions: Option<&FunctionSet>,
    ) -> Result<LlmResponse> {
        let estimated = self.session.config.token_budget().check(messages)?;
        debug!(estimated_tokens = estimated, "sending messages");
        self.session.llm.complete(&CompletionRequest {
            messages,
            functions,
            temperature: self.session.config.llm.temperature,
        })
    }

    /// Snapshot the transcript under `name` (a fresh unique name when `None`).
    pub fn save_branch(&mut self, name: Option<&str>) -> String {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.branches.insert(name.clone(), self.messages.clone());
        debug!(branch = %name, messages = self.messages.len(), "saved branch");
        name
    }

    /// Replace the transcript with the snapshot saved under `name`.
    ///
    /// With `reload_files`, injected file-content blocks are refreshed from
    /// the project directory, since files may have changed since the save.
    pub fn load_branch(&mut self, name: &str, reload_files: bool) -> Result<()> {
        let snapshot = self
            .branches
            .get(name)
            .ok_or_else(|| anyhow!("unknown conversation branch {name}"))?;
        let mut messages = snapshot.clone();
        if reload_files {
            let root = self.session.project_root;
            for message in &mut messages {
                if has_file_blocks(&message.content) {
                    message.content = refresh_file_blocks(root, &message.content);
                }
            }
        }
        info!(branch = %name, messages = messages.len(), reload_files, "restored branch");
        self.messages = messages;
        Ok(())
    }

    /// Drop the last `n` messages, never the system message at index 0.
    pub fn remove_last_x_messages(&mut self, n: usize) {
        let keep = self.messages.len().saturating_sub(n).max(1);
        self.messages.truncate(keep);
    }
}

/// Extract and validate the structured payload of a reply.
///
/// Function calls use their arguments. Text replies may wrap the JSON object
/// in Markdown fences or prose; the outermost `{...}` is used.
pub fn parse_structured(
    reply: &LlmResponse,
    functions: &FunctionSet,
) -> std::result::Result<Value, String> {
    let (def, raw) = match reply {
        LlmResponse::FunctionCall { name, arguments } => {
            let def = functions
                .find(name)
                .ok_or_else(|| format!("unknown function {name}"))?;
            (def, arguments.as_str())
        }
        LlmResponse::Text(text) => {
            let def = functions
                .primary()
                .ok_or_else(|| "no function schema to validate against".to_string())?;
            (def, text.as_str())
        }
    };
    let json_text = extract_json_object(raw).ok_or_else(|| "no JSON object found".to_string())?;
    let value: Value =
        serde_json::from_str(json_text).map_err(|e| format!("invalid JSON: {e}"))?;
    def.validate(&value).map_err(|e| e.to_string())?;
    Ok(value)
}

fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}
