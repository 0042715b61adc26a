//! Pilot configuration stored as TOML (default `<config dir>/pilot/config.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::timeouts::RunTimeLimits;
use crate::core::tokens::TokenBudget;

/// When the command executor asks a human before running a command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmPolicy {
    Always,
    #[default]
    Destructive,
    Never,
}

/// Pilot configuration (TOML).
///
/// Missing fields default to values that suit interactive use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PilotConfig {
    /// Output is not judged before a command has run this long.
    pub min_command_run_time_ms: u64,

    /// Commands are force-terminated after this long.
    pub max_command_run_time_ms: u64,

    /// Characters kept per stream when building the CLI response.
    pub max_command_output_length: usize,

    /// Repair attempts per debug call (also bounds replans within an attempt).
    pub max_command_debug_tries: u32,

    /// Nested debug calls allowed before giving up.
    pub max_recursion_layer: u32,

    /// Window between the terminate signal and the forceful kill.
    pub terminate_grace_ms: u64,

    pub confirm_commands: ConfirmPolicy,

    /// Where apps, steps and command runs are persisted. Defaults to `~/.pilot`.
    pub state_dir: Option<PathBuf>,

    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API.
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    /// Total model context in tokens.
    pub max_tokens: usize,
    /// Tokens kept free for the reply.
    pub min_tokens_for_response: usize,
    /// Retries for rate limiting and server errors.
    pub max_retries: u32,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 8192,
            min_tokens_for_response: 600,
            max_retries: 3,
            connect_timeout_secs: 30,
            read_timeout_secs: 300,
        }
    }
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            min_command_run_time_ms: 2000,
            max_command_run_time_ms: 60_000,
            max_command_output_length: 50_000,
            max_command_debug_tries: 3,
            max_recursion_layer: 3,
            terminate_grace_ms: 1000,
            confirm_commands: ConfirmPolicy::default(),
            state_dir: None,
            llm: LlmConfig::default(),
        }
    }
}

impl PilotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_command_run_time_ms == 0 {
            return Err(anyhow!("max_command_run_time_ms must be > 0"));
        }
        if self.min_command_run_time_ms > self.max_command_run_time_ms {
            return Err(anyhow!(
                "min_command_run_time_ms must not exceed max_command_run_time_ms"
            ));
        }
        if self.max_command_output_length == 0 {
            return Err(anyhow!("max_command_output_length must be > 0"));
        }
        if self.max_command_debug_tries == 0 {
            return Err(anyhow!("max_command_debug_tries must be > 0"));
        }
        if self.llm.endpoint.trim().is_empty() {
            return Err(anyhow!("llm.endpoint must be non-empty"));
        }
        if self.llm.model.trim().is_empty() {
            return Err(anyhow!("llm.model must be non-empty"));
        }
        if self.llm.min_tokens_for_response >= self.llm.max_tokens {
            return Err(anyhow!(
                "llm.min_tokens_for_response must be below llm.max_tokens"
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(anyhow!("llm.temperature must be within 0.0..=2.0"));
        }
        Ok(())
    }

    pub fn run_time_limits(&self) -> RunTimeLimits {
        RunTimeLimits::from_millis(self.min_command_run_time_ms, self.max_command_run_time_ms)
    }

    pub fn token_budget(&self) -> TokenBudget {
        TokenBudget {
            max_tokens: self.llm.max_tokens,
            reserved_for_response: self.llm.min_tokens_for_response,
        }
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    /// Configured state directory, or `~/.pilot`.
    pub fn resolved_state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(dir.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".pilot"))
            .ok_or_else(|| anyhow!("cannot resolve home directory; set state_dir"))
    }

    /// Apply environment overrides using `lookup` (normally `std::env::var`).
    ///
    /// Recognised: `OPENAI_API_KEY`, `OPENAI_ENDPOINT`, `MODEL_NAME`, `MAX_TOKENS`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = non_empty("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(endpoint) = non_empty("OPENAI_ENDPOINT") {
            self.llm.endpoint = endpoint;
        }
        if let Some(model) = non_empty("MODEL_NAME") {
            self.llm.model = model;
        }
        if let Some(raw) = non_empty("MAX_TOKENS") {
            self.llm.max_tokens = raw
                .trim()
                .parse()
                .with_context(|| format!("parse MAX_TOKENS={raw}"))?;
        }
        debug!(endpoint = %self.llm.endpoint, model = %self.llm.model, "applied environment overrides");
        Ok(())
    }
}

/// Default config location, `<config dir>/pilot/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("pilot").join("config.toml"))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<PilotConfig> {
    if !path.exists() {
        let cfg = PilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::files::write_atomic(path, &buf)
}
