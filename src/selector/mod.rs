//! DPO pair selection and quality gates.
//!
//! Takes the joined candidates of a retired batch, picks the best and
//! worst by overall score, and emits a preference pair only when every
//! quality gate passes. A skipped batch is not an error; SFT records for
//! the batch were already written by the aggregator.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::retrieval::Passage;
use crate::sink::{DpoMetadata, DpoRecord, DpoSide};

/// Phrases that disqualify an answer from being a chosen example.
/// A preference-trained model copies its chosen answers; evasive text must
/// never be on the chosen side.
const HEDGING_PHRASES: &[&str] = &[
    "unfortunately",
    "the provided documents do not mention",
    "the documents do not mention",
    "the context does not mention",
    "i don't see",
    "i'm not sure",
    "i cannot find",
    "there is no information",
];

/// Token-identity ratio above which a chosen answer counts as a verbatim
/// copy of a context passage.
const VERBATIM_THRESHOLD: f64 = 0.95;

/// One candidate with both its answer and its verification joined.
#[derive(Debug, Clone)]
pub struct PreferenceCandidate {
    /// Globally unique answer identifier.
    pub answer_id: Uuid,
    /// Position within the batch.
    pub candidate_index: usize,
    /// Answer text.
    pub text: String,
    /// Groundedness score, used as a tie-break.
    pub faithfulness: f64,
    /// Overall verification score.
    pub overall: f64,
}

/// Why a batch produced no DPO pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ScoreDiffTooSmall,
    ChosenScoreTooLow,
    ChosenIsVerbatim,
    ChosenIsHedging,
    InsufficientCandidates,
    BatchTimedOut,
}

impl SkipReason {
    /// Stable reason code used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ScoreDiffTooSmall => "score_diff_too_small",
            SkipReason::ChosenScoreTooLow => "chosen_score_too_low",
            SkipReason::ChosenIsVerbatim => "chosen_is_verbatim",
            SkipReason::ChosenIsHedging => "chosen_is_hedging",
            SkipReason::InsufficientCandidates => "insufficient_candidates",
            SkipReason::BatchTimedOut => "batch_timed_out",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the selection gates.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Minimum `chosen.overall - rejected.overall`.
    pub min_score_diff: f64,
    /// Minimum overall score for the chosen side.
    pub min_chosen_score: f64,
    /// Reject pairs whose chosen answer is a near-verbatim context copy.
    pub enable_verbatim_gate: bool,
    /// Reject pairs whose chosen answer hedges.
    pub enable_hedging_gate: bool,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            min_score_diff: 0.3,
            min_chosen_score: 0.7,
            enable_verbatim_gate: true,
            enable_hedging_gate: true,
        }
    }
}

/// Running acceptance statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SelectorStats {
    pub attempted: u64,
    pub created: u64,
    pub skipped: HashMap<String, u64>,
}

/// DPO pair selector.
pub struct DpoSelector {
    config: SelectorConfig,
    stats: Mutex<SelectorStats>,
}

impl DpoSelector {
    /// Creates a selector with the given gate configuration.
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(SelectorStats::default()),
        }
    }

    /// Selects a preference pair from a retired batch.
    ///
    /// `candidates` must each carry both an answer and a score; the
    /// aggregator guarantees this. Returns the record to emit, or the
    /// reason the batch was skipped.
    pub fn select(
        &self,
        batch_id: Uuid,
        question: &str,
        contexts: &[Passage],
        candidates: &[PreferenceCandidate],
    ) -> Result<DpoRecord, SkipReason> {
        self.bump_attempted();

        if candidates.len() < 2 {
            return Err(self.skip(SkipReason::InsufficientCandidates));
        }

        let mut ranked: Vec<&PreferenceCandidate> = candidates.iter().collect();
        ranked.sort_by(|a, b| {
            b.overall
                .total_cmp(&a.overall)
                .then(b.faithfulness.total_cmp(&a.faithfulness))
                .then(a.candidate_index.cmp(&b.candidate_index))
        });

        let chosen = ranked[0];
        let rejected = ranked[ranked.len() - 1];
        let score_difference = chosen.overall - rejected.overall;

        if score_difference < self.config.min_score_diff {
            return Err(self.skip(SkipReason::ScoreDiffTooSmall));
        }

        if chosen.overall < self.config.min_chosen_score {
            return Err(self.skip(SkipReason::ChosenScoreTooLow));
        }

        if self.config.enable_verbatim_gate && is_verbatim_copy(&chosen.text, contexts) {
            return Err(self.skip(SkipReason::ChosenIsVerbatim));
        }

        if self.config.enable_hedging_gate && is_hedging(&chosen.text) {
            return Err(self.skip(SkipReason::ChosenIsHedging));
        }

        self.bump_created();

        Ok(DpoRecord {
            prompt: question.to_string(),
            chosen: DpoSide {
                text: chosen.text.clone(),
                score: chosen.overall,
            },
            rejected: DpoSide {
                text: rejected.text.clone(),
                score: rejected.overall,
            },
            score_difference,
            metadata: DpoMetadata {
                batch_id,
                chosen_index: chosen.candidate_index,
                rejected_index: rejected.candidate_index,
                created_at: Utc::now(),
            },
        })
    }

    /// Records a skip decided outside the gate logic (for example a batch
    /// that timed out before gathering two scored candidates).
    pub fn record_skip(&self, reason: SkipReason) {
        self.bump_attempted();
        self.skip(reason);
    }

    /// Snapshot of the acceptance statistics.
    pub fn stats(&self) -> SelectorStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn bump_attempted(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.attempted += 1;
        }
    }

    fn bump_created(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.created += 1;
        }
    }

    fn skip(&self, reason: SkipReason) -> SkipReason {
        if let Ok(mut stats) = self.stats.lock() {
            *stats.skipped.entry(reason.as_str().to_string()).or_insert(0) += 1;
        }
        crate::metrics::record_dpo_skip(reason.as_str());
        reason
    }
}

/// Lowercased alphanumeric tokens.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Returns whether `answer` is at least 95% token-identical to any single
/// context passage.
fn is_verbatim_copy(answer: &str, contexts: &[Passage]) -> bool {
    let answer_tokens = tokenize(answer);
    if answer_tokens.is_empty() {
        return false;
    }

    contexts.iter().any(|passage| {
        let mut passage_counts: HashMap<String, usize> = HashMap::new();
        for token in tokenize(&passage.text) {
            *passage_counts.entry(token).or_insert(0) += 1;
        }

        let mut matched = 0;
        for token in &answer_tokens {
            if let Some(count) = passage_counts.get_mut(token) {
                if *count > 0 {
                    *count -= 1;
                    matched += 1;
                }
            }
        }

        matched as f64 / answer_tokens.len() as f64 >= VERBATIM_THRESHOLD
    })
}

/// Returns whether `answer` contains hedging phrasing.
fn is_hedging(answer: &str) -> bool {
    let lower = answer.to_lowercase();
    HEDGING_PHRASES.iter().any(|p| lower.contains(p))
}
