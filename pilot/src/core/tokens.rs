//! Token estimation and context budget checks.
//!
//! The estimate is a byte heuristic, not a tokenizer. It errs on the side of
//! over-counting so the budget check fires before the API rejects a request.

use crate::core::types::Message;
use crate::error::LlmError;

/// Rough bytes per token for English prose and source code.
const BYTES_PER_TOKEN: usize = 4;
/// Fixed framing cost per chat message (role, separators).
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

pub fn estimate_text_tokens(text: &str) -> usize {
    text.len().div_ceil(BYTES_PER_TOKEN)
}

pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| estimate_text_tokens(&m.content) + MESSAGE_OVERHEAD_TOKENS)
        .sum()
}

/// Context window split between prompt and reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    /// Total model context in tokens.
    pub max_tokens: usize,
    /// Tokens kept free for the model's reply.
    pub reserved_for_response: usize,
}

impl TokenBudget {
    pub fn prompt_limit(&self) -> usize {
        self.max_tokens.saturating_sub(self.reserved_for_response)
    }

    /// Fail with [`LlmError::TokenLimit`] when `messages` would not leave room for a reply.
    pub fn check(&self, messages: &[Message]) -> Result<usize, LlmError> {
        let estimated = estimate_messages_tokens(messages);
        let limit = self.prompt_limit();
        if estimated > limit {
            return Err(LlmError::TokenLimit { estimated, limit });
        }
        Ok(estimated)
    }
}
