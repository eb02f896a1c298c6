//! Context retrieval client.
//!
//! Fetches the top-K passages for a question from the retrieval service.
//! The vector store itself (ingestion, embedding, indexing) is an external
//! collaborator; this module only speaks its search API and applies capped
//! exponential backoff on transient failures.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;

/// Maximum number of attempts against the retrieval backend.
const MAX_ATTEMPTS: u32 = 3;

/// First retry delay; doubles per attempt up to [`MAX_RETRY_DELAY`].
const BASE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Cap on the retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// A retrieved context passage.
///
/// Lifetime is per-request; passages are embedded into events and dataset
/// records but never persisted on their own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Passage {
    /// Passage text.
    pub text: String,
    /// Identifier of the source document/chunk.
    pub source_id: String,
    /// Retrieval similarity score (higher is more relevant).
    pub score: f64,
}

impl Passage {
    /// Creates a new passage.
    pub fn new(text: impl Into<String>, source_id: impl Into<String>, score: f64) -> Self {
        Self {
            text: text.into(),
            source_id: source_id.into(),
            score,
        }
    }
}

/// Trait for context retrieval backends.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Fetch up to `k` passages for `question`, ordered by descending score.
    async fn retrieve(&self, question: &str, k: usize) -> Result<Vec<Passage>, RetrievalError>;
}

/// HTTP client for the retrieval service's search endpoint.
///
/// Sends `POST {base_url}/search` with `{"query": ..., "limit": k}` and
/// expects a JSON array of `{text, source_id, score}` objects.
pub struct HttpRetriever {
    base_url: String,
    http_client: Client,
    request_timeout: Duration,
}

impl HttpRetriever {
    /// Creates a retriever client for the given base URL.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            http_client: Client::new(),
            request_timeout,
        }
    }

    /// Single request against the search endpoint.
    async fn search_once(&self, question: &str, k: usize) -> Result<Vec<Passage>, RetrievalError> {
        let url = format!("{}/search", self.base_url);
        let body = SearchRequest {
            query: question,
            limit: k,
        };

        let request = self
            .http_client
            .post(&url)
            .json(&body)
            .timeout(self.request_timeout)
            .send();

        let response = match request.await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(RetrievalError::Timeout {
                    seconds: self.request_timeout.as_secs(),
                })
            }
            Err(e) => return Err(RetrievalError::Unavailable(e.to_string())),
        };

        let status = response.status();
        if status.is_server_error() {
            return Err(RetrievalError::Unavailable(format!(
                "search returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(RetrievalError::InvalidResponse(format!(
                "search returned {}",
                status
            )));
        }

        let mut passages: Vec<Passage> = response
            .json()
            .await
            .map_err(|e| RetrievalError::InvalidResponse(e.to_string()))?;

        // Backend is expected to sort, but the ordering guarantee is ours.
        passages.sort_by(|a, b| b.score.total_cmp(&a.score));
        passages.truncate(k);

        Ok(passages)
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn retrieve(&self, question: &str, k: usize) -> Result<Vec<Passage>, RetrievalError> {
        let mut delay = BASE_RETRY_DELAY;
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                // Jitter keeps concurrent requests from retrying in lockstep.
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
                tokio::time::sleep(delay + jitter).await;
                delay = (delay * 2).min(MAX_RETRY_DELAY);
                tracing::debug!(attempt = attempt + 1, "Retrying context retrieval");
            }

            match self.search_once(question, k).await {
                Ok(passages) => {
                    tracing::debug!(passages = passages.len(), "Retrieved context passages");
                    return Ok(passages);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "Transient retrieval failure");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(RetrievalError::RetriesExhausted {
            attempts: MAX_ATTEMPTS,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    limit: usize,
}
