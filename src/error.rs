//! Error types for prefforge operations.
//!
//! Defines error types for the backend-facing subsystems:
//! - Context retrieval
//! - Candidate answer generation
//! - Judge scoring
//! - Dataset sink I/O
//!
//! Transport (bus) and configuration errors live next to their modules.

use thiserror::Error;

/// Errors that can occur while retrieving context passages.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Retrieval backend unavailable: {0}")]
    Unavailable(String),

    #[error("Retrieval request timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Retrieval backend returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Retrieval failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl RetrievalError {
    /// Returns whether this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RetrievalError::Unavailable(_) | RetrievalError::Timeout { .. }
        )
    }
}

/// Errors that can occur while generating a candidate answer.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Generation refused by backend: {0}")]
    Refused(String),

    #[error("Generation backend returned an empty completion")]
    EmptyCompletion,

    #[error("LLM error: {0}")]
    Llm(#[from] crate::llm::LlmError),
}

/// Errors that can occur while scoring an answer.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("Judge call timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Failed to parse judge response: {0}")]
    ParseError(String),

    #[error(
        "Judge returned out-of-range scores: faithfulness={faithfulness}, relevancy={relevancy}"
    )]
    OutOfRange { faithfulness: f64, relevancy: f64 },

    #[error("LLM error: {0}")]
    Llm(#[from] crate::llm::LlmError),
}

impl JudgeError {
    /// Returns whether this error is worth retrying before falling back
    /// to the heuristic scorer.
    pub fn is_transient(&self) -> bool {
        match self {
            JudgeError::Timeout { .. } => true,
            JudgeError::Llm(e) => e.is_transient(),
            JudgeError::ParseError(_) | JudgeError::OutOfRange { .. } => false,
        }
    }
}

/// Errors that can occur while writing dataset records.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to acquire exclusive lock on '{path}': {reason}")]
    LockFailed { path: String, reason: String },

    #[error("Sink write failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
