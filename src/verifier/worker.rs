//! Verifier worker pool.
//!
//! Each worker leases `answer.generated` events, scores the answer, and
//! publishes `verification.completed`. Events are acked only after the
//! verification event is on the bus, so a crash between judge and publish
//! results in redelivery, never loss.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{HeuristicJudge, Judge, JudgeMode, JudgeScores, ScoredCandidate};
use crate::bus::{
    AnswerGeneratedPayload, Delivery, EventBus, EventEnvelope, EventPayload, GROUP_VERIFIER,
    TOPIC_ANSWER_GENERATED,
};
use crate::metrics;

/// Configuration for the verifier pool.
#[derive(Debug, Clone)]
pub struct VerifierPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Maximum concurrent judge calls across all workers.
    pub judge_concurrency: usize,
    /// How long a worker blocks waiting for an event.
    pub poll_interval: Duration,
    /// Attempts against the LLM judge before heuristic fallback.
    pub max_judge_retries: u32,
    /// First judge retry delay; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for VerifierPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            judge_concurrency: 4,
            poll_interval: Duration::from_secs(1),
            max_judge_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Pool of verifier workers sharing one judge concurrency budget.
pub struct VerifierPool {
    config: VerifierPoolConfig,
    bus: Arc<dyn EventBus>,
    judge: Arc<dyn Judge>,
    judge_semaphore: Arc<Semaphore>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl VerifierPool {
    /// Creates a pool over the given bus and judge.
    pub fn new(config: VerifierPoolConfig, bus: Arc<dyn EventBus>, judge: Arc<dyn Judge>) -> Self {
        let judge_semaphore = Arc::new(Semaphore::new(config.judge_concurrency));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            bus,
            judge,
            judge_semaphore,
            shutdown_tx,
            worker_handles: Vec::new(),
        }
    }

    /// Starts all workers. Recovers leases from a previous crashed run first.
    pub async fn start(&mut self) {
        if let Err(e) = self.bus.recover(TOPIC_ANSWER_GENERATED, GROUP_VERIFIER).await {
            warn!(error = %e, "Failed to recover verifier leases");
        }

        for i in 0..self.config.num_workers {
            let worker = VerifierWorker {
                id: format!("verifier-{}", i),
                bus: Arc::clone(&self.bus),
                judge: Arc::clone(&self.judge),
                heuristic: HeuristicJudge::new(),
                judge_semaphore: Arc::clone(&self.judge_semaphore),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                max_judge_retries: self.config.max_judge_retries,
                retry_base_delay: self.config.retry_base_delay,
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        info!(num_workers = self.config.num_workers, "Verifier pool started");
    }

    /// Signals all workers to stop and waits for them to drain.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());

        let drain = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Verifier worker panicked during shutdown");
                }
            }
        };

        if tokio::time::timeout(self.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!("Verifier pool shutdown timed out");
        } else {
            info!("Verifier pool shutdown complete");
        }
    }
}

/// A single verifier worker.
pub struct VerifierWorker {
    id: String,
    bus: Arc<dyn EventBus>,
    judge: Arc<dyn Judge>,
    heuristic: HeuristicJudge,
    judge_semaphore: Arc<Semaphore>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    max_judge_retries: u32,
    retry_base_delay: Duration,
}

impl VerifierWorker {
    /// Main worker loop: lease, score, publish, ack.
    pub async fn run(mut self) {
        info!(worker_id = %self.id, "Verifier worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Verifier worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self
                .bus
                .receive(TOPIC_ANSWER_GENERATED, GROUP_VERIFIER, self.poll_interval)
                .await
            {
                Ok(Some(delivery)) => self.process(delivery).await,
                Ok(None) => {
                    debug!(worker_id = %self.id, "No answer events available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to receive from bus");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Verifier worker stopped");
    }

    /// Handles one `answer.generated` event end to end.
    async fn process(&self, delivery: Delivery) {
        let correlation_id = delivery.envelope.correlation_id;
        let batch_id = delivery.envelope.batch_id;

        let payload = match &delivery.envelope.payload {
            EventPayload::AnswerGenerated(payload) => payload.clone(),
            other => {
                error!(
                    worker_id = %self.id,
                    correlation_id = %correlation_id,
                    batch_id = %batch_id,
                    "Unexpected payload kind on answer topic: {:?}",
                    std::mem::discriminant(other)
                );
                if let Err(e) = self.bus.dead_letter(&delivery, "unexpected payload").await {
                    error!(correlation_id = %correlation_id, error = %e, "Dead-letter failed");
                }
                return;
            }
        };

        debug!(
            worker_id = %self.id,
            correlation_id = %correlation_id,
            batch_id = %batch_id,
            answer_id = %payload.answer_id,
            candidate_index = payload.candidate_index,
            "Scoring candidate"
        );

        let (scores, mode) = self.score_with_fallback(&payload, correlation_id).await;
        metrics::record_judge_call(mode);
        let mode_label = match mode {
            JudgeMode::Llm => "llm",
            JudgeMode::Heuristic => "heuristic",
        };

        let scored = ScoredCandidate::from_scores(payload.answer_id, batch_id, scores, mode);
        let envelope = EventEnvelope::verification_completed(correlation_id, batch_id, scored);

        match self.bus.publish(&envelope).await {
            Ok(()) => {
                info!(
                    worker_id = %self.id,
                    correlation_id = %correlation_id,
                    batch_id = %batch_id,
                    answer_id = %payload.answer_id,
                    faithfulness = scores.faithfulness,
                    relevancy = scores.relevancy,
                    judge_mode = mode_label,
                    "Published verification"
                );
                if let Err(e) = self.bus.ack(&delivery).await {
                    error!(
                        correlation_id = %correlation_id,
                        batch_id = %batch_id,
                        error = %e,
                        "Failed to ack answer event"
                    );
                }
            }
            Err(e) => {
                // Leave unacked: the event will be redelivered and scored
                // again, and the aggregator collapses the duplicate.
                error!(
                    correlation_id = %correlation_id,
                    batch_id = %batch_id,
                    error = %e,
                    "Failed to publish verification, leaving event leased"
                );
            }
        }
    }

    /// Scores via the LLM judge with bounded retries, falling back to the
    /// heuristic scorer on persistent failure.
    async fn score_with_fallback(
        &self,
        payload: &AnswerGeneratedPayload,
        correlation_id: uuid::Uuid,
    ) -> (JudgeScores, JudgeMode) {
        let permit = self.judge_semaphore.acquire().await;
        if permit.is_ok() {
            let mut delay = self.retry_base_delay;
            for attempt in 0..self.max_judge_retries {
                if attempt > 0 {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }

                match self
                    .judge
                    .judge(&payload.question, &payload.contexts, &payload.answer)
                    .await
                {
                    Ok(scores) => return (scores, JudgeMode::Llm),
                    Err(e) if e.is_transient() && attempt + 1 < self.max_judge_retries => {
                        warn!(
                            correlation_id = %correlation_id,
                            answer_id = %payload.answer_id,
                            attempt = attempt + 1,
                            error = %e,
                            "Transient judge failure, retrying"
                        );
                    }
                    Err(e) => {
                        warn!(
                            correlation_id = %correlation_id,
                            answer_id = %payload.answer_id,
                            error = %e,
                            "Judge failed, falling back to heuristic scoring"
                        );
                        break;
                    }
                }
            }
        }

        metrics::record_judge_fallback();
        let scores =
            self.heuristic
                .score(&payload.question, &payload.contexts, &payload.answer);
        (scores, JudgeMode::Heuristic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusRoutes, InMemoryBus, TOPIC_VERIFICATION_COMPLETED, GROUP_AGGREGATOR};
    use crate::error::JudgeError;
    use crate::generation::SamplingParams;
    use crate::retrieval::Passage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct FixedJudge {
        faithfulness: f64,
        relevancy: f64,
    }

    #[async_trait]
    impl Judge for FixedJudge {
        async fn judge(
            &self,
            _question: &str,
            _contexts: &[Passage],
            _answer: &str,
        ) -> Result<JudgeScores, JudgeError> {
            Ok(JudgeScores {
                faithfulness: self.faithfulness,
                relevancy: self.relevancy,
            })
        }
    }

    struct FailingJudge {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Judge for FailingJudge {
        async fn judge(
            &self,
            _question: &str,
            _contexts: &[Passage],
            _answer: &str,
        ) -> Result<JudgeScores, JudgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(JudgeError::Timeout { seconds: 60 })
        }
    }

    fn worker_with_judge(bus: Arc<InMemoryBus>, judge: Arc<dyn Judge>) -> VerifierWorker {
        // The sender side is dropped; tests drive process() directly and
        // never enter the run() loop that polls for shutdown.
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        VerifierWorker {
            id: "verifier-test".into(),
            bus,
            judge,
            heuristic: HeuristicJudge::new(),
            judge_semaphore: Arc::new(Semaphore::new(4)),
            shutdown_rx,
            poll_interval: Duration::from_millis(20),
            max_judge_retries: 3,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    fn answer_envelope() -> EventEnvelope {
        EventEnvelope::answer_generated(
            Uuid::new_v4(),
            Uuid::new_v4(),
            AnswerGeneratedPayload {
                question: "What is a load balancer?".into(),
                answer: "It distributes traffic across backend servers.".into(),
                contexts: vec![Passage::new(
                    "Load balancers distribute traffic across servers.",
                    "doc-1",
                    0.9,
                )],
                expected_count: 1,
                candidate_index: 0,
                answer_id: Uuid::new_v4(),
                sampling_params: SamplingParams::with_temperature(0.2),
            },
        )
    }

    #[tokio::test]
    async fn test_process_publishes_verification_and_acks() {
        let bus = Arc::new(InMemoryBus::new(BusRoutes::standard()));
        let judge = Arc::new(FixedJudge {
            faithfulness: 0.9,
            relevancy: 0.8,
        });
        let worker = worker_with_judge(Arc::clone(&bus), judge);

        let envelope = answer_envelope();
        let batch_id = envelope.batch_id;
        bus.publish(&envelope).await.expect("publish");

        let delivery = bus
            .receive(TOPIC_ANSWER_GENERATED, GROUP_VERIFIER, Duration::from_millis(50))
            .await
            .expect("receive")
            .expect("message");
        worker.process(delivery).await;

        // Verification landed on the aggregator's queue.
        let verification = bus
            .receive(
                TOPIC_VERIFICATION_COMPLETED,
                GROUP_AGGREGATOR,
                Duration::from_millis(50),
            )
            .await
            .expect("receive")
            .expect("verification available");
        assert_eq!(verification.envelope.batch_id, batch_id);
        match verification.envelope.payload {
            EventPayload::VerificationCompleted(ref scored) => {
                assert!((scored.overall - 0.85).abs() < 1e-9);
                assert_eq!(scored.judge_mode, JudgeMode::Llm);
            }
            _ => panic!("wrong payload"),
        }

        // Original answer event was acked: nothing to recover.
        assert_eq!(
            bus.recover(TOPIC_ANSWER_GENERATED, GROUP_VERIFIER)
                .await
                .expect("recover"),
            0
        );
    }

    #[tokio::test]
    async fn test_persistent_judge_failure_falls_back_to_heuristic() {
        let bus = Arc::new(InMemoryBus::new(BusRoutes::standard()));
        let judge = Arc::new(FailingJudge {
            calls: AtomicU32::new(0),
        });
        let judge_dyn: Arc<dyn Judge> = judge.clone();
        let worker = worker_with_judge(Arc::clone(&bus), judge_dyn);

        bus.publish(&answer_envelope()).await.expect("publish");
        let delivery = bus
            .receive(TOPIC_ANSWER_GENERATED, GROUP_VERIFIER, Duration::from_millis(50))
            .await
            .expect("receive")
            .expect("message");
        worker.process(delivery).await;

        assert_eq!(judge.calls.load(Ordering::SeqCst), 3);

        let verification = bus
            .receive(
                TOPIC_VERIFICATION_COMPLETED,
                GROUP_AGGREGATOR,
                Duration::from_millis(50),
            )
            .await
            .expect("receive")
            .expect("verification available");
        match verification.envelope.payload {
            EventPayload::VerificationCompleted(ref scored) => {
                assert_eq!(scored.judge_mode, JudgeMode::Heuristic);
                assert!((0.3..=1.0).contains(&scored.faithfulness));
            }
            _ => panic!("wrong payload"),
        }
    }
}
