//! Question orchestrator: the synchronous fan-out side of the pipeline.
//!
//! `ask_multi` turns one question into one candidate batch: retrieve
//! contexts once, generate N candidates under varied sampling profiles,
//! publish one `answer.generated` event per surviving candidate, and
//! reply synchronously with the candidate list. The orchestrator is the
//! only producer of `answer.generated` and the authority on
//! `expected_count`, which always reflects the post-drop candidate count.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{AnswerGeneratedPayload, BusError, EventBus, EventEnvelope};
use crate::error::RetrievalError;
use crate::generation::{Candidate, Generator, SamplingParams, SamplingSchedule};
use crate::retrieval::{Passage, Retriever};

/// Hard cap on candidates per batch.
pub const MAX_CANDIDATES: usize = 8;

/// Errors that can fail a synchronous ask.
#[derive(Debug, Error)]
pub enum AskError {
    #[error("Question must not be empty")]
    EmptyQuestion,

    #[error("Question exceeds {max} bytes")]
    QuestionTooLong { max: usize },

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
}

/// Maximum accepted question size in bytes.
const MAX_QUESTION_BYTES: usize = 4096;

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Default number of candidates per question.
    pub num_candidates: usize,
    /// Passages to retrieve per question.
    pub top_k: usize,
    /// Maximum concurrent generator calls.
    pub generation_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            num_candidates: 3,
            top_k: 5,
            generation_concurrency: 4,
        }
    }
}

/// One candidate in a synchronous response.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateSummary {
    pub candidate_index: usize,
    pub text: String,
    pub answer_id: Uuid,
    pub sampling_params: SamplingParams,
}

/// Synchronous response of [`QaOrchestrator::ask_multi`].
#[derive(Debug, Clone, Serialize)]
pub struct MultiAnswerResponse {
    pub batch_id: Uuid,
    pub correlation_id: Uuid,
    pub candidates: Vec<CandidateSummary>,
    /// How many `answer.generated` events actually reached the bus.
    pub events_published: usize,
}

/// Synchronous response of [`QaOrchestrator::ask`].
#[derive(Debug, Clone, Serialize)]
pub struct AnswerResponse {
    pub batch_id: Uuid,
    pub correlation_id: Uuid,
    pub answer: String,
    pub contexts: Vec<Passage>,
    pub event_published: bool,
}

/// The question orchestrator.
pub struct QaOrchestrator {
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn Generator>,
    bus: Arc<dyn EventBus>,
    schedule: SamplingSchedule,
    config: OrchestratorConfig,
    generation_semaphore: Arc<Semaphore>,
}

impl QaOrchestrator {
    /// Creates an orchestrator over the given backends.
    pub fn new(
        retriever: Arc<dyn Retriever>,
        generator: Arc<dyn Generator>,
        bus: Arc<dyn EventBus>,
        schedule: SamplingSchedule,
        config: OrchestratorConfig,
    ) -> Self {
        let generation_semaphore = Arc::new(Semaphore::new(config.generation_concurrency.max(1)));
        Self {
            retriever,
            generator,
            bus,
            schedule,
            config,
            generation_semaphore,
        }
    }

    /// Generates a candidate batch for a question.
    ///
    /// Failed candidate slots are dropped; `expected_count` on the
    /// published events reflects the surviving count. Publish failures do
    /// not fail the synchronous reply; the affected candidates simply
    /// never reach the verification path.
    pub async fn ask_multi(
        &self,
        question: &str,
        num_candidates: Option<usize>,
    ) -> Result<MultiAnswerResponse, AskError> {
        validate_question(question)?;

        let n = num_candidates
            .unwrap_or(self.config.num_candidates)
            .clamp(1, MAX_CANDIDATES);
        let correlation_id = Uuid::new_v4();
        let batch_id = Uuid::new_v4();

        info!(
            correlation_id = %correlation_id,
            batch_id = %batch_id,
            num_candidates = n,
            "Handling multi-candidate ask"
        );

        let contexts = self.retrieve(question, correlation_id).await?;

        let candidates = self
            .generate_candidates(question, &contexts, n, correlation_id, batch_id)
            .await;

        if candidates.is_empty() {
            warn!(
                correlation_id = %correlation_id,
                batch_id = %batch_id,
                "Every candidate slot failed generation"
            );
        }

        let expected_count = candidates.len();
        let mut events_published = 0;

        for candidate in &candidates {
            match self
                .publish_candidate(question, &contexts, candidate, expected_count, correlation_id, batch_id)
                .await
            {
                Ok(()) => events_published += 1,
                Err(e) => {
                    error!(
                        correlation_id = %correlation_id,
                        batch_id = %batch_id,
                        answer_id = %candidate.answer_id,
                        error = %e,
                        "Failed to publish answer event"
                    );
                }
            }
        }

        info!(
            correlation_id = %correlation_id,
            batch_id = %batch_id,
            candidates = candidates.len(),
            events_published,
            "Batch published"
        );

        Ok(MultiAnswerResponse {
            batch_id,
            correlation_id,
            candidates: candidates
                .into_iter()
                .map(|c| CandidateSummary {
                    candidate_index: c.candidate_index,
                    text: c.text,
                    answer_id: c.answer_id,
                    sampling_params: c.sampling_params,
                })
                .collect(),
            events_published,
        })
    }

    /// Answers a question with a single candidate.
    ///
    /// The answer is still published as a single-candidate batch when
    /// `publish` is set, feeding the SFT stream (a one-candidate batch
    /// never produces a DPO pair).
    pub async fn ask(&self, question: &str, publish: bool) -> Result<AnswerResponse, AskError> {
        validate_question(question)?;

        let correlation_id = Uuid::new_v4();
        let batch_id = Uuid::new_v4();

        info!(correlation_id = %correlation_id, batch_id = %batch_id, "Handling single ask");

        let contexts = self.retrieve(question, correlation_id).await?;

        let candidates = self
            .generate_candidates(question, &contexts, 1, correlation_id, batch_id)
            .await;

        let Some(candidate) = candidates.into_iter().next() else {
            return Ok(AnswerResponse {
                batch_id,
                correlation_id,
                answer: String::new(),
                contexts,
                event_published: false,
            });
        };

        let mut event_published = false;
        if publish {
            match self
                .publish_candidate(question, &contexts, &candidate, 1, correlation_id, batch_id)
                .await
            {
                Ok(()) => event_published = true,
                Err(e) => {
                    error!(
                        correlation_id = %correlation_id,
                        batch_id = %batch_id,
                        error = %e,
                        "Failed to publish answer event"
                    );
                }
            }
        }

        Ok(AnswerResponse {
            batch_id,
            correlation_id,
            answer: candidate.text,
            contexts,
            event_published,
        })
    }

    async fn retrieve(
        &self,
        question: &str,
        correlation_id: Uuid,
    ) -> Result<Vec<Passage>, AskError> {
        let contexts = self.retriever.retrieve(question, self.config.top_k).await?;
        info!(
            correlation_id = %correlation_id,
            passages = contexts.len(),
            "Retrieved contexts"
        );
        Ok(contexts)
    }

    /// Runs up to `n` generator calls concurrently, one per sampling
    /// profile slot, dropping failed slots.
    async fn generate_candidates(
        &self,
        question: &str,
        contexts: &[Passage],
        n: usize,
        correlation_id: Uuid,
        batch_id: Uuid,
    ) -> Vec<Candidate> {
        let tasks = (0..n).map(|i| {
            let params = self.schedule.profile_for(i).clone();
            let generator = Arc::clone(&self.generator);
            let semaphore = Arc::clone(&self.generation_semaphore);
            async move {
                let _permit = semaphore.acquire().await;
                let result = generator.generate(question, contexts, &params).await;
                (i, params, result)
            }
        });

        let mut candidates = Vec::with_capacity(n);
        for (i, params, result) in join_all(tasks).await {
            match result {
                Ok(text) => {
                    let candidate = Candidate::new(i, text, params);
                    info!(
                        correlation_id = %correlation_id,
                        batch_id = %batch_id,
                        candidate_index = i,
                        answer_id = %candidate.answer_id,
                        temperature = candidate.sampling_params.temperature,
                        "Generated candidate"
                    );
                    candidates.push(candidate);
                }
                Err(e) => {
                    warn!(
                        correlation_id = %correlation_id,
                        batch_id = %batch_id,
                        candidate_index = i,
                        error = %e,
                        "Candidate slot dropped"
                    );
                }
            }
        }

        candidates
    }

    async fn publish_candidate(
        &self,
        question: &str,
        contexts: &[Passage],
        candidate: &Candidate,
        expected_count: usize,
        correlation_id: Uuid,
        batch_id: Uuid,
    ) -> Result<(), BusError> {
        let payload = AnswerGeneratedPayload {
            question: question.to_string(),
            answer: candidate.text.clone(),
            contexts: contexts.to_vec(),
            expected_count,
            candidate_index: candidate.candidate_index,
            answer_id: candidate.answer_id,
            sampling_params: candidate.sampling_params.clone(),
        };

        let envelope = EventEnvelope::answer_generated(correlation_id, batch_id, payload);
        self.bus.publish(&envelope).await
    }
}

fn validate_question(question: &str) -> Result<(), AskError> {
    if question.trim().is_empty() {
        return Err(AskError::EmptyQuestion);
    }
    if question.len() > MAX_QUESTION_BYTES {
        return Err(AskError::QuestionTooLong {
            max: MAX_QUESTION_BYTES,
        });
    }
    Ok(())
}
