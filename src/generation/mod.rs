//! Multi-candidate answer generation.
//!
//! Produces N candidate answers for a question under a schedule of varied
//! sampling parameters. Candidates must differ for downstream DPO pairing
//! to work: the quality gates need score variance, which needs answer
//! variance, so every slot in a batch uses a different sampling profile.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GenerationError;
use crate::llm::{ChatBackend, ChatRequest, Message};
use crate::retrieval::Passage;

/// Default temperature schedule: deterministic, balanced, creative.
pub const DEFAULT_TEMPERATURES: [f64; 3] = [0.2, 0.7, 1.0];

/// Default completion budget per candidate.
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Prompt template for answering from retrieved context.
///
/// Instructs the model to ground the answer in the numbered passages and
/// to avoid hedging phrases that poison preference pairs downstream.
const QA_PROMPT: &str = "You are an expert assistant. Your goal is to provide clear, actionable guidance.\n\n\
Context from documentation:\n{context}\n\n\
Question: {question}\n\n\
Instructions:\n\
1. Provide a direct, helpful answer based on the context above\n\
2. If the context contains relevant information, use it to give specific guidance\n\
3. If the context is incomplete, combine what's available with general best practices\n\
4. Focus on actionable recommendations rather than disclaimers\n\
5. Avoid phrases like 'the documents do not mention' or 'unfortunately' - instead, provide what you know\n\
6. Be concise but thorough\n\n\
Answer:";

/// Sampling parameters for one candidate generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingParams {
    /// Sampling temperature.
    pub temperature: f64,
    /// Optional nucleus sampling parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Completion token budget.
    pub max_tokens: u32,
    /// Optional sampling seed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl SamplingParams {
    /// Creates sampling parameters with the given temperature and defaults
    /// for everything else.
    pub fn with_temperature(temperature: f64) -> Self {
        Self {
            temperature,
            top_p: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            seed: None,
        }
    }

    /// Sets the nucleus sampling parameter.
    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }
}

/// Schedule of sampling profiles for a multi-candidate batch.
///
/// Candidate `i` uses profile `i % len`, so batches larger than the
/// schedule cycle through it.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingSchedule {
    profiles: Vec<SamplingParams>,
}

impl Default for SamplingSchedule {
    fn default() -> Self {
        Self {
            profiles: DEFAULT_TEMPERATURES
                .iter()
                .map(|&t| SamplingParams::with_temperature(t))
                .collect(),
        }
    }
}

impl SamplingSchedule {
    /// Creates a schedule from explicit profiles.
    ///
    /// Returns `None` for an empty profile list.
    pub fn new(profiles: Vec<SamplingParams>) -> Option<Self> {
        if profiles.is_empty() {
            None
        } else {
            Some(Self { profiles })
        }
    }

    /// Parses a schedule from a comma-separated spec like `"0.2,0.7:0.9,1.0"`,
    /// where each entry is `temperature` or `temperature:top_p`.
    pub fn parse(spec: &str) -> Option<Self> {
        let mut profiles = Vec::new();
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let mut parts = entry.splitn(2, ':');
            let temperature: f64 = parts.next()?.trim().parse().ok()?;
            let mut profile = SamplingParams::with_temperature(temperature);
            if let Some(top_p) = parts.next() {
                profile = profile.with_top_p(top_p.trim().parse().ok()?);
            }
            profiles.push(profile);
        }
        Self::new(profiles)
    }

    /// Returns the profile for the given candidate index.
    pub fn profile_for(&self, candidate_index: usize) -> &SamplingParams {
        &self.profiles[candidate_index % self.profiles.len()]
    }

    /// Number of distinct profiles in the schedule.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Returns whether the schedule is empty (never true by construction).
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// One generated candidate answer, identified within its batch by
/// `candidate_index` and globally by `answer_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Position of this candidate within its batch.
    pub candidate_index: usize,
    /// Generated answer text.
    pub text: String,
    /// Sampling parameters used to produce the answer.
    pub sampling_params: SamplingParams,
    /// Globally unique identifier for this answer.
    pub answer_id: Uuid,
    /// When the candidate was generated.
    pub created_at: DateTime<Utc>,
}

impl Candidate {
    /// Creates a candidate with a fresh `answer_id`.
    pub fn new(candidate_index: usize, text: impl Into<String>, params: SamplingParams) -> Self {
        Self {
            candidate_index,
            text: text.into(),
            sampling_params: params,
            answer_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }
}

/// Trait for answer generation backends.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate one answer for `question` grounded in `contexts` under the
    /// given sampling parameters.
    async fn generate(
        &self,
        question: &str,
        contexts: &[Passage],
        params: &SamplingParams,
    ) -> Result<String, GenerationError>;
}

/// LLM-backed answer generator.
pub struct LlmGenerator {
    backend: Arc<dyn ChatBackend>,
    model: String,
    call_timeout: Duration,
}

impl LlmGenerator {
    /// Creates a generator over the given chat backend.
    pub fn new(backend: Arc<dyn ChatBackend>, model: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            backend,
            model: model.into(),
            call_timeout,
        }
    }

    /// Renders the QA prompt with numbered context passages.
    fn render_prompt(question: &str, contexts: &[Passage]) -> String {
        let context_text = contexts
            .iter()
            .enumerate()
            .map(|(i, p)| format!("[Document {}] {}", i + 1, p.text))
            .collect::<Vec<_>>()
            .join("\n\n");

        QA_PROMPT
            .replace("{context}", &context_text)
            .replace("{question}", question)
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(
        &self,
        question: &str,
        contexts: &[Passage],
        params: &SamplingParams,
    ) -> Result<String, GenerationError> {
        let prompt = Self::render_prompt(question, contexts);

        let mut request = ChatRequest::new(&self.model, vec![Message::user(prompt)])
            .with_temperature(params.temperature)
            .with_max_tokens(params.max_tokens);
        if let Some(top_p) = params.top_p {
            request = request.with_top_p(top_p);
        }
        if let Some(seed) = params.seed {
            request = request.with_seed(seed);
        }

        let response = tokio::time::timeout(self.call_timeout, self.backend.complete(request))
            .await
            .map_err(|_| GenerationError::Timeout {
                seconds: self.call_timeout.as_secs(),
            })??;

        let text = response.text.trim();
        if text.is_empty() {
            return Err(GenerationError::EmptyCompletion);
        }
        Ok(text.to_string())
    }
}
