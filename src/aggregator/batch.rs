//! Per-batch join state.
//!
//! Each open batch is an entity with its own lifecycle: created by the
//! first event carrying its `batch_id`, fed by answer and verification
//! upserts, and retired exactly once on completion or deadline. Candidates
//! reference their batch by id only; the batch owns all joined state.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::bus::{AnswerGeneratedPayload, Delivery};
use crate::generation::SamplingParams;
use crate::retrieval::Passage;
use crate::verifier::ScoredCandidate;

/// Answer-side state for one candidate.
#[derive(Debug, Clone)]
pub struct BatchAnswer {
    pub answer_id: Uuid,
    pub candidate_index: usize,
    pub text: String,
    pub sampling_params: SamplingParams,
}

/// A candidate that has both an answer and a score.
#[derive(Debug, Clone)]
pub struct JoinedCandidate {
    pub answer: BatchAnswer,
    pub score: ScoredCandidate,
}

/// Question-level state learned from the batch's first answer event.
///
/// Verification events may arrive before any answer event; until an answer
/// event lands, the batch has no question, contexts, or expected count.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub question: String,
    pub contexts: Vec<Passage>,
    pub expected_count: usize,
}

/// One open batch in the aggregator's table.
#[derive(Debug)]
pub struct OpenBatch {
    pub batch_id: Uuid,
    pub correlation_id: Uuid,
    pub context: Option<BatchContext>,
    pub answers: HashMap<Uuid, BatchAnswer>,
    pub scores: HashMap<Uuid, ScoredCandidate>,
    pub first_seen_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Leases held until the batch retires; acked in bulk so a crash
    /// mid-batch replays the whole batch instead of losing events.
    pub deliveries: Vec<Delivery>,
}

impl OpenBatch {
    /// Opens a batch for its first observed event.
    pub fn open(batch_id: Uuid, correlation_id: Uuid, timeout: std::time::Duration) -> Self {
        let now = Utc::now();
        let timeout = ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::minutes(30));
        Self {
            batch_id,
            correlation_id,
            context: None,
            answers: HashMap::new(),
            scores: HashMap::new(),
            first_seen_at: now,
            deadline: now + timeout,
            deliveries: Vec::new(),
        }
    }

    /// Applies an `answer.generated` payload. Idempotent on `answer_id`.
    ///
    /// The first answer event also teaches the batch its question,
    /// contexts, and expected count; the orchestrator is the authority on
    /// all three, so later events never overwrite them.
    pub fn upsert_answer(&mut self, payload: &AnswerGeneratedPayload) {
        if self.context.is_none() {
            self.context = Some(BatchContext {
                question: payload.question.clone(),
                contexts: payload.contexts.clone(),
                expected_count: payload.expected_count,
            });
        }

        self.answers.insert(
            payload.answer_id,
            BatchAnswer {
                answer_id: payload.answer_id,
                candidate_index: payload.candidate_index,
                text: payload.answer.clone(),
                sampling_params: payload.sampling_params.clone(),
            },
        );
    }

    /// Applies a `verification.completed` payload. Idempotent on `answer_id`.
    pub fn upsert_score(&mut self, scored: &ScoredCandidate) {
        self.scores.insert(scored.answer_id, scored.clone());
    }

    /// Completion predicate: every expected candidate has both an answer
    /// and a score, and the two keysets coincide.
    pub fn is_complete(&self) -> bool {
        let Some(context) = &self.context else {
            return false;
        };

        self.answers.len() == context.expected_count
            && self.scores.len() == context.expected_count
            && self.answers.keys().all(|id| self.scores.contains_key(id))
    }

    /// Returns whether the batch's deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Candidates holding both an answer and a score, ordered by
    /// `candidate_index` for stable emission order.
    pub fn joined(&self) -> Vec<JoinedCandidate> {
        let mut joined: Vec<JoinedCandidate> = self
            .answers
            .values()
            .filter_map(|answer| {
                self.scores.get(&answer.answer_id).map(|score| JoinedCandidate {
                    answer: answer.clone(),
                    score: score.clone(),
                })
            })
            .collect();
        joined.sort_by_key(|c| c.answer.candidate_index);
        joined
    }
}

/// Bounded set of recently retired batch ids.
///
/// Events for a retired batch are discarded instead of reopening the
/// batch; without this, one late verification would resurrect a batch
/// that can never complete and emit duplicate records at its deadline.
#[derive(Debug)]
pub struct RetiredLru {
    capacity: usize,
    order: VecDeque<Uuid>,
    members: HashSet<Uuid>,
}

impl RetiredLru {
    /// Creates an LRU holding up to `capacity` batch ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Records a retirement, evicting the oldest entry at capacity.
    pub fn insert(&mut self, batch_id: Uuid) {
        if self.members.insert(batch_id) {
            self.order.push_back(batch_id);
            if self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.members.remove(&evicted);
                }
            }
        }
    }

    /// Returns whether the batch was recently retired.
    pub fn contains(&self, batch_id: &Uuid) -> bool {
        self.members.contains(batch_id)
    }

    /// Number of remembered batch ids.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns whether no retirements are remembered.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
