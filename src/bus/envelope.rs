//! Event envelope and payload schemas.
//!
//! All events share one envelope structure:
//! - `event_id`: unique identifier for deduplication and dead-letter bookkeeping
//! - `event_type`: topic discriminator
//! - `correlation_id`: request-scoped tracing identifier
//! - `batch_id`: grouping key for the aggregator
//! - `timestamp`: publish time
//! - `payload`: event-specific data

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::generation::SamplingParams;
use crate::retrieval::Passage;
use crate::verifier::ScoredCandidate;

/// Topic name for candidate-answer events.
pub const TOPIC_ANSWER_GENERATED: &str = "answer.generated";

/// Topic name for verification-result events.
pub const TOPIC_VERIFICATION_COMPLETED: &str = "verification.completed";

/// Discriminator for the two event kinds the pipeline exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "answer.generated")]
    AnswerGenerated,
    #[serde(rename = "verification.completed")]
    VerificationCompleted,
}

impl EventType {
    /// Returns the topic this event type is routed on.
    pub fn topic(&self) -> &'static str {
        match self {
            EventType::AnswerGenerated => TOPIC_ANSWER_GENERATED,
            EventType::VerificationCompleted => TOPIC_VERIFICATION_COMPLETED,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.topic())
    }
}

/// Payload of an `answer.generated` event.
///
/// Carries everything the verifier needs to score the answer without a
/// lookaside store, plus `expected_count` so the aggregator can learn the
/// batch size from any event of the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerGeneratedPayload {
    /// The question being answered.
    pub question: String,
    /// The generated candidate answer.
    pub answer: String,
    /// Context passages the answer was grounded in.
    pub contexts: Vec<Passage>,
    /// Number of candidates published for this batch (post-drop).
    pub expected_count: usize,
    /// Position of this candidate within the batch.
    pub candidate_index: usize,
    /// Globally unique answer identifier.
    pub answer_id: Uuid,
    /// Sampling parameters used for this candidate.
    pub sampling_params: SamplingParams,
}

/// Event-specific payload data.
///
/// Untagged: the envelope's `event_type` field is the discriminator on the
/// wire; variants deserialize by their distinct required fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    AnswerGenerated(AnswerGeneratedPayload),
    VerificationCompleted(ScoredCandidate),
}

/// Envelope wrapping every event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: Uuid,
    /// Event kind, also the routing topic.
    pub event_type: EventType,
    /// Request-scoped tracing identifier.
    pub correlation_id: Uuid,
    /// Batch grouping key.
    pub batch_id: Uuid,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// Event-specific data.
    pub payload: EventPayload,
}

impl EventEnvelope {
    /// Creates an `answer.generated` envelope.
    pub fn answer_generated(
        correlation_id: Uuid,
        batch_id: Uuid,
        payload: AnswerGeneratedPayload,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: EventType::AnswerGenerated,
            correlation_id,
            batch_id,
            timestamp: Utc::now(),
            payload: EventPayload::AnswerGenerated(payload),
        }
    }

    /// Creates a `verification.completed` envelope.
    pub fn verification_completed(
        correlation_id: Uuid,
        batch_id: Uuid,
        scored: ScoredCandidate,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: EventType::VerificationCompleted,
            correlation_id,
            batch_id,
            timestamp: Utc::now(),
            payload: EventPayload::VerificationCompleted(scored),
        }
    }

    /// Returns the topic this envelope is routed on.
    pub fn topic(&self) -> &'static str {
        self.event_type.topic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::{Confidence, JudgeMode};

    fn answer_payload() -> AnswerGeneratedPayload {
        AnswerGeneratedPayload {
            question: "What is a load balancer?".into(),
            answer: "It distributes traffic across servers.".into(),
            contexts: vec![Passage::new("Load balancers distribute traffic.", "doc-1", 0.9)],
            expected_count: 3,
            candidate_index: 0,
            answer_id: Uuid::new_v4(),
            sampling_params: SamplingParams::with_temperature(0.2),
        }
    }

    #[test]
    fn test_event_type_topics() {
        assert_eq!(EventType::AnswerGenerated.topic(), "answer.generated");
        assert_eq!(
            EventType::VerificationCompleted.topic(),
            "verification.completed"
        );
    }

    #[test]
    fn test_answer_envelope_roundtrip() {
        let correlation_id = Uuid::new_v4();
        let batch_id = Uuid::new_v4();
        let envelope = EventEnvelope::answer_generated(correlation_id, batch_id, answer_payload());

        let json = serde_json::to_string(&envelope).expect("serialize");
        assert!(json.contains("\"answer.generated\""));

        let parsed: EventEnvelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.correlation_id, correlation_id);
        assert_eq!(parsed.batch_id, batch_id);
        assert_eq!(parsed.event_type, EventType::AnswerGenerated);
        match parsed.payload {
            EventPayload::AnswerGenerated(p) => assert_eq!(p.expected_count, 3),
            _ => panic!("wrong payload variant"),
        }
    }

    #[test]
    fn test_verification_envelope_roundtrip() {
        let batch_id = Uuid::new_v4();
        let scored = ScoredCandidate {
            answer_id: Uuid::new_v4(),
            batch_id,
            faithfulness: 0.9,
            relevancy: 0.8,
            overall: 0.85,
            confidence: Confidence::High,
            judge_mode: JudgeMode::Llm,
            scored_at: Utc::now(),
        };
        let envelope = EventEnvelope::verification_completed(Uuid::new_v4(), batch_id, scored);

        let json = serde_json::to_string(&envelope).expect("serialize");
        let parsed: EventEnvelope = serde_json::from_str(&json).expect("deserialize");
        match parsed.payload {
            EventPayload::VerificationCompleted(s) => {
                assert!((s.overall - 0.85).abs() < f64::EPSILON);
                assert_eq!(s.batch_id, batch_id);
            }
            _ => panic!("wrong payload variant"),
        }
    }
}
