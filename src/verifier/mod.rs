//! Answer verification: judge scoring and the verifier worker.
//!
//! One `answer.generated` event in, one `verification.completed` event out.
//! Scoring prefers an LLM judge; parse failures, out-of-range scores, and
//! persistent backend errors fall back to a deterministic heuristic so the
//! pipeline keeps producing scored candidates when the judge is down.

mod heuristic;
mod judge;
mod worker;

pub use heuristic::HeuristicJudge;
pub use judge::LlmJudge;
pub use worker::{VerifierPool, VerifierPoolConfig, VerifierWorker};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JudgeError;
use crate::retrieval::Passage;

/// Confidence band derived from the two rubric scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// Derives the band: `high` if both scores are at least 0.8, `low` if
    /// both are below 0.6, otherwise `medium`.
    pub fn from_scores(faithfulness: f64, relevancy: f64) -> Self {
        if faithfulness.min(relevancy) >= 0.8 {
            Confidence::High
        } else if faithfulness.max(relevancy) < 0.6 {
            Confidence::Low
        } else {
            Confidence::Medium
        }
    }
}

/// Which scoring path produced a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeMode {
    Llm,
    Heuristic,
}

/// Raw rubric scores from a judge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JudgeScores {
    /// How grounded the answer is in the contexts, in [0, 1].
    pub faithfulness: f64,
    /// How well the answer addresses the question, in [0, 1].
    pub relevancy: f64,
}

/// A fully scored candidate, the payload of `verification.completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredCandidate {
    /// The answer this verification belongs to.
    pub answer_id: Uuid,
    /// The batch the answer belongs to.
    pub batch_id: Uuid,
    /// Groundedness score in [0, 1].
    pub faithfulness: f64,
    /// Relevancy score in [0, 1].
    pub relevancy: f64,
    /// Mean of faithfulness and relevancy.
    pub overall: f64,
    /// Confidence band.
    pub confidence: Confidence,
    /// Scoring path that produced the scores.
    pub judge_mode: JudgeMode,
    /// When scoring finished.
    pub scored_at: DateTime<Utc>,
}

impl ScoredCandidate {
    /// Builds a scored candidate from raw judge scores, deriving the
    /// overall score and the confidence band.
    pub fn from_scores(
        answer_id: Uuid,
        batch_id: Uuid,
        scores: JudgeScores,
        judge_mode: JudgeMode,
    ) -> Self {
        Self {
            answer_id,
            batch_id,
            faithfulness: scores.faithfulness,
            relevancy: scores.relevancy,
            overall: (scores.faithfulness + scores.relevancy) / 2.0,
            confidence: Confidence::from_scores(scores.faithfulness, scores.relevancy),
            judge_mode,
            scored_at: Utc::now(),
        }
    }
}

/// Trait for answer-quality judges.
#[async_trait]
pub trait Judge: Send + Sync {
    /// Scores `answer` against `question` and `contexts`, returning both
    /// rubric scores in [0, 1].
    async fn judge(
        &self,
        question: &str,
        contexts: &[Passage],
        answer: &str,
    ) -> Result<JudgeScores, JudgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_bands() {
        assert_eq!(Confidence::from_scores(0.9, 0.85), Confidence::High);
        assert_eq!(Confidence::from_scores(0.8, 0.8), Confidence::High);
        assert_eq!(Confidence::from_scores(0.5, 0.55), Confidence::Low);
        assert_eq!(Confidence::from_scores(0.9, 0.5), Confidence::Medium);
        assert_eq!(Confidence::from_scores(0.7, 0.7), Confidence::Medium);
    }

    #[test]
    fn test_scored_candidate_overall() {
        let scored = ScoredCandidate::from_scores(
            Uuid::new_v4(),
            Uuid::new_v4(),
            JudgeScores {
                faithfulness: 0.9,
                relevancy: 0.8,
            },
            JudgeMode::Llm,
        );
        assert!((scored.overall - 0.85).abs() < 1e-9);
        assert_eq!(scored.confidence, Confidence::High);
    }

    #[test]
    fn test_serde_lowercase_tags() {
        let scored = ScoredCandidate::from_scores(
            Uuid::new_v4(),
            Uuid::new_v4(),
            JudgeScores {
                faithfulness: 0.4,
                relevancy: 0.5,
            },
            JudgeMode::Heuristic,
        );
        let json = serde_json::to_string(&scored).expect("serialize");
        assert!(json.contains("\"confidence\":\"low\""));
        assert!(json.contains("\"judge_mode\":\"heuristic\""));
    }
}
