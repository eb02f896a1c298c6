//! Chat backend shared by the generator and the judge.
//!
//! Both LLM touchpoints are single-turn prompts against an
//! OpenAI-compatible gateway; this module provides the `ChatBackend`
//! seam, the request/turn types, and the retrying HTTP client.

mod client;

pub use client::{ChatBackend, ChatClient, ChatRequest, ChatResponse, Message, Role};

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: LLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

impl LlmError {
    /// Returns whether the error is transient and worth retrying.
    ///
    /// Rate limits, 5xx responses, and connection-level failures are
    /// retried; 4xx responses and parse failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited(_) | LlmError::RequestFailed(_) => true,
            LlmError::ApiError { code, .. } => *code >= 500,
            LlmError::MissingApiBase | LlmError::ParseError(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::RateLimited("slow down".into()).is_transient());
        assert!(LlmError::RequestFailed("connection reset".into()).is_transient());
        assert!(LlmError::ApiError {
            code: 503,
            message: "overloaded".into()
        }
        .is_transient());

        assert!(!LlmError::ApiError {
            code: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!LlmError::ParseError("truncated".into()).is_transient());
        assert!(!LlmError::MissingApiBase.is_transient());
    }
}
