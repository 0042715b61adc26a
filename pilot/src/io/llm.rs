//! LLM client abstraction and an OpenAI-compatible chat completions client.
//!
//! The [`LlmClient`] trait decouples conversations from the HTTP backend.
//! Tests use scripted clients that return predetermined replies.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::functions::FunctionSet;
use crate::core::tokens::estimate_messages_tokens;
use crate::core::types::Message;
use crate::error::LlmError;
use crate::io::config::LlmConfig;

/// One chat completion call.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub messages: &'a [Message],
    /// When set, the model is forced to answer by calling the primary function.
    pub functions: Option<&'a FunctionSet>,
    pub temperature: f32,
}

/// Raw model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmResponse {
    Text(String),
    FunctionCall { name: String, arguments: String },
}

impl LlmResponse {
    /// Text as stored in the transcript.
    pub fn transcript_text(&self) -> &str {
        match self {
            LlmResponse::Text(text) => text,
            LlmResponse::FunctionCall { arguments, .. } => arguments,
        }
    }
}

/// Abstraction over chat completion backends.
///
/// Implementations report context overflow as [`LlmError::TokenLimit`] and
/// transport/auth failures as [`LlmError::Api`].
pub trait LlmClient {
    fn complete(&self, request: &CompletionRequest<'_>) -> Result<LlmResponse>;
}

/// Client for `POST {endpoint}/chat/completions`.
pub struct OpenAiClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: usize,
    max_retries: u32,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                LlmError::Api("no API key configured (set OPENAI_API_KEY or --api-key)".into())
            })?;
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }

    fn body(&self, request: &CompletionRequest<'_>) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
        });
        if let Some(set) = request.functions {
            body["functions"] = json!(set.definitions);
            if let Some(primary) = set.primary() {
                body["function_call"] = json!({"name": primary.name});
            }
        }
        body
    }
}

impl LlmClient for OpenAiClient {
    #[instrument(skip_all, fields(model = %self.model, messages = request.messages.len()))]
    fn complete(&self, request: &CompletionRequest<'_>) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = self.body(request);
        let mut attempt = 0u32;
        loop {
            debug!(attempt, "sending chat completion");
            let response = match self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
            {
                Ok(response) => response,
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt < self.max_retries => {
                    warn!(err = %e, attempt, "transport error, retrying");
                    thread::sleep(backoff(attempt));
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(LlmError::Api(format!("request failed: {e}")).into()),
            };

            let status = response.status().as_u16();
            if response.status().is_success() {
                let value: Value = response.json().context("parse completion response")?;
                let reply = parse_completion(&value)?;
                info!(status, "completion received");
                return Ok(reply);
            }

            let text = response.text().unwrap_or_default();
            match classify_failure(status, &text) {
                FailureKind::TokenLimit => {
                    return Err(LlmError::TokenLimit {
                        estimated: estimate_messages_tokens(request.messages),
                        limit: self.max_tokens,
                    }
                    .into());
                }
                FailureKind::Retryable if attempt < self.max_retries => {
                    warn!(status, attempt, "retryable API error");
                    thread::sleep(backoff(attempt));
                    attempt += 1;
                }
                FailureKind::Retryable | FailureKind::Fatal => {
                    return Err(LlmError::Api(format!("HTTP {status}: {}", text.trim())).into());
                }
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(5))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    TokenLimit,
    Retryable,
    Fatal,
}

fn classify_failure(status: u16, body: &str) -> FailureKind {
    let lower = body.to_ascii_lowercase();
    if (status == 400 || status == 413)
        && (lower.contains("context_length_exceeded") || lower.contains("maximum context length"))
    {
        return FailureKind::TokenLimit;
    }
    if status == 429 || status >= 500 {
        return FailureKind::Retryable;
    }
    FailureKind::Fatal
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    function_call: Option<WireFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireCompletion {
    choices: Vec<WireChoice>,
}

fn parse_completion(value: &Value) -> Result<LlmResponse> {
    let completion: WireCompletion = serde_json::from_value(value.clone())
        .map_err(|e| LlmError::MalformedResponse(format!("unexpected completion shape: {e}")))?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::MalformedResponse("completion has no choices".into()))?;
    if let Some(call) = choice.message.function_call {
        return Ok(LlmResponse::FunctionCall {
            name: call.name,
            arguments: call.arguments,
        });
    }
    match choice.message.content {
        Some(text) => Ok(LlmResponse::Text(text)),
        None => Err(LlmError::MalformedResponse("completion has no content".into()).into()),
    }
}
