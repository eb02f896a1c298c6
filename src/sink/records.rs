//! Persistent record schemas for the two training streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::generation::SamplingParams;
use crate::retrieval::Passage;
use crate::verifier::{Confidence, JudgeMode, ScoredCandidate};

/// Verification block embedded in an SFT record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftVerification {
    pub faithfulness: f64,
    pub relevancy: f64,
    pub overall: f64,
    pub confidence: Confidence,
}

impl From<&ScoredCandidate> for SftVerification {
    fn from(scored: &ScoredCandidate) -> Self {
        Self {
            faithfulness: scored.faithfulness,
            relevancy: scored.relevancy,
            overall: scored.overall,
            confidence: scored.confidence,
        }
    }
}

/// Provenance block embedded in an SFT record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftMetadata {
    pub batch_id: Uuid,
    pub candidate_index: usize,
    pub sampling_params: SamplingParams,
    pub judge_mode: JudgeMode,
}

/// One supervised fine-tuning record: a question, one scored answer, and
/// the contexts the answer was grounded in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftRecord {
    pub question: String,
    pub answer: String,
    pub contexts: Vec<Passage>,
    pub verification: SftVerification,
    pub metadata: SftMetadata,
    pub timestamp: DateTime<Utc>,
}

/// One side of a DPO preference pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpoSide {
    pub text: String,
    pub score: f64,
}

/// Provenance block embedded in a DPO record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpoMetadata {
    pub batch_id: Uuid,
    pub chosen_index: usize,
    pub rejected_index: usize,
    pub created_at: DateTime<Utc>,
}

/// One Direct Preference Optimization record: the prompt plus the best and
/// worst scored answers from a batch. At most one is emitted per batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpoRecord {
    pub prompt: String,
    pub chosen: DpoSide,
    pub rejected: DpoSide,
    pub score_difference: f64,
    pub metadata: DpoMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::JudgeScores;

    #[test]
    fn test_sft_verification_from_scored() {
        let scored = ScoredCandidate::from_scores(
            Uuid::new_v4(),
            Uuid::new_v4(),
            JudgeScores {
                faithfulness: 0.9,
                relevancy: 0.7,
            },
            JudgeMode::Llm,
        );
        let verification = SftVerification::from(&scored);
        assert!((verification.overall - 0.8).abs() < 1e-9);
        assert_eq!(verification.confidence, Confidence::Medium);
    }

    #[test]
    fn test_sft_record_roundtrip() {
        let record = SftRecord {
            question: "q".into(),
            answer: "a".into(),
            contexts: vec![Passage::new("ctx", "src", 0.9)],
            verification: SftVerification {
                faithfulness: 0.8,
                relevancy: 0.9,
                overall: 0.85,
                confidence: Confidence::High,
            },
            metadata: SftMetadata {
                batch_id: Uuid::new_v4(),
                candidate_index: 1,
                sampling_params: SamplingParams::with_temperature(0.7),
                judge_mode: JudgeMode::Llm,
            },
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&record).expect("serialize");
        let parsed: SftRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.metadata.candidate_index, 1);
        assert_eq!(parsed.question, "q");
    }

    #[test]
    fn test_dpo_record_roundtrip() {
        let record = DpoRecord {
            prompt: "the question".into(),
            chosen: DpoSide {
                text: "good answer".into(),
                score: 0.9,
            },
            rejected: DpoSide {
                text: "bad answer".into(),
                score: 0.45,
            },
            score_difference: 0.45,
            metadata: DpoMetadata {
                batch_id: Uuid::new_v4(),
                chosen_index: 0,
                rejected_index: 2,
                created_at: Utc::now(),
            },
        };

        let json = serde_json::to_string(&record).expect("serialize");
        let parsed: DpoRecord = serde_json::from_str(&json).expect("deserialize");
        assert!((parsed.score_difference - 0.45).abs() < 1e-9);
        assert_eq!(parsed.metadata.rejected_index, 2);
    }
}
