//! Typed error kinds that callers make control decisions on.
//!
//! Everything else travels as a plain [`anyhow::Error`]. These types are
//! attached to `anyhow` errors and recovered with `downcast_ref`.

use thiserror::Error;

/// Failures raised by the conversation/LLM boundary.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The transcript plus the next prompt would not fit the model context.
    #[error("token limit exceeded: ~{estimated} tokens requested, budget is {limit}")]
    TokenLimit { estimated: usize, limit: usize },
    /// The reply could not be parsed into the expected structure.
    #[error("malformed LLM response: {0}")]
    MalformedResponse(String),
    /// Transport, authentication or server-side failure.
    #[error("LLM API error: {0}")]
    Api(String),
}

/// Raised by `Debugger::debug` when nested repair exceeds the layer limit.
#[derive(Debug, Error)]
#[error("debugging recursion exceeded the maximum of {max} layers")]
pub struct TooDeepRecursionError {
    pub max: u32,
}

/// Raised when the global interrupt flag stops a task between steps.
#[derive(Debug, Error)]
#[error("interrupted by user")]
pub struct InterruptedError;

/// True when `err` (or anything in its chain) is a token-limit failure.
pub fn is_token_limit(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<LlmError>(),
            Some(LlmError::TokenLimit { .. })
        )
    })
}

/// True when `err` (or anything in its chain) is an interrupt.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<InterruptedError>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    /// Verifies chain inspection finds a token-limit error behind added context.
    #[test]
    fn token_limit_found_through_context() {
        let err = Err::<(), _>(LlmError::TokenLimit {
            estimated: 10,
            limit: 5,
        })
        .context("send debug prompt")
        .unwrap_err();
        assert!(is_token_limit(&err));
        assert!(!is_interrupted(&err));
    }

    #[test]
    fn api_error_is_not_token_limit() {
        let err = anyhow::Error::new(LlmError::Api("401".to_string()));
        assert!(!is_token_limit(&err));
    }
}
