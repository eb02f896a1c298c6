//! Batch aggregator: joins answers to their verifications per batch.
//!
//! A single logical actor consumes both event topics, groups events by
//! `batch_id`, and retires each batch exactly once, either when the
//! completion predicate holds or when the batch deadline passes. On
//! retirement it emits one SFT record per fully joined candidate, hands
//! the joined candidates to the DPO selector, acks every lease it holds
//! for the batch, and remembers the batch id so late events are discarded.
//!
//! Crash recovery: leases are acked only at retirement, so the state of
//! every open batch is reconstructable by replaying the unacked messages;
//! `run` recovers them on startup.

mod batch;

pub use batch::{BatchAnswer, BatchContext, JoinedCandidate, OpenBatch, RetiredLru};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{
    Delivery, EventBus, EventPayload, GROUP_AGGREGATOR, TOPIC_ANSWER_GENERATED,
    TOPIC_VERIFICATION_COMPLETED,
};
use crate::error::SinkError;
use crate::metrics;
use crate::selector::{DpoSelector, PreferenceCandidate, SkipReason};
use crate::sink::{JsonlSink, SftMetadata, SftRecord, SftVerification};

/// Configuration for the batch aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// How long a batch may stay open before retiring incomplete.
    pub batch_timeout: Duration,
    /// Open-batch cap; consumption pauses above it.
    pub max_open_batches: usize,
    /// How long one receive poll blocks per topic.
    pub poll_interval: Duration,
    /// How often expired batches are swept.
    pub sweep_interval: Duration,
    /// Capacity of the retired-batch LRU.
    pub retired_lru_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_secs(30 * 60),
            max_open_batches: 10_000,
            poll_interval: Duration::from_millis(250),
            sweep_interval: Duration::from_secs(5),
            retired_lru_capacity: 1024,
        }
    }
}

/// The batch aggregation actor.
pub struct BatchAggregator {
    config: AggregatorConfig,
    bus: Arc<dyn EventBus>,
    sft_sink: Arc<JsonlSink>,
    dpo_sink: Arc<JsonlSink>,
    selector: Arc<DpoSelector>,
    batches: HashMap<Uuid, OpenBatch>,
    retired: RetiredLru,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl BatchAggregator {
    /// Creates an aggregator over the given bus, sinks, and selector.
    pub fn new(
        config: AggregatorConfig,
        bus: Arc<dyn EventBus>,
        sft_sink: Arc<JsonlSink>,
        dpo_sink: Arc<JsonlSink>,
        selector: Arc<DpoSelector>,
    ) -> Self {
        let retired = RetiredLru::new(config.retired_lru_capacity);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Self {
            config,
            bus,
            sft_sink,
            dpo_sink,
            selector,
            batches: HashMap::new(),
            retired,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Handle used to stop the aggregator from another task.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Number of currently open batches.
    pub fn open_batches(&self) -> usize {
        self.batches.len()
    }

    /// Main loop: recover leases, then consume both topics until shutdown.
    ///
    /// Returns an error only on an unrecoverable sink failure; stalling the
    /// consumer is preferred over dropping records, so the loop halts with
    /// its leases unacked and a restart replays them.
    pub async fn run(mut self) -> Result<(), SinkError> {
        for topic in [TOPIC_ANSWER_GENERATED, TOPIC_VERIFICATION_COMPLETED] {
            if let Err(e) = self.bus.recover(topic, GROUP_AGGREGATOR).await {
                warn!(topic, error = %e, "Failed to recover aggregator leases");
            }
        }

        info!(
            batch_timeout_secs = self.config.batch_timeout.as_secs(),
            max_open_batches = self.config.max_open_batches,
            "Batch aggregator started"
        );

        let mut last_sweep = tokio::time::Instant::now();

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!("Batch aggregator received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if last_sweep.elapsed() >= self.config.sweep_interval {
                self.sweep_expired().await?;
                last_sweep = tokio::time::Instant::now();
            }

            // Backpressure: above the cap, stop consuming and let the
            // sweep drain completed or expired batches.
            if self.batches.len() >= self.config.max_open_batches {
                warn!(
                    open_batches = self.batches.len(),
                    cap = self.config.max_open_batches,
                    "Open-batch cap reached, pausing consumption"
                );
                tokio::time::sleep(self.config.sweep_interval).await;
                self.sweep_expired().await?;
                last_sweep = tokio::time::Instant::now();
                continue;
            }

            for topic in [TOPIC_ANSWER_GENERATED, TOPIC_VERIFICATION_COMPLETED] {
                let received = self
                    .bus
                    .receive(topic, GROUP_AGGREGATOR, self.config.poll_interval)
                    .await;
                match received {
                    Ok(Some(delivery)) => self.handle_delivery(delivery).await?,
                    Ok(None) => {}
                    Err(e) => {
                        error!(topic, error = %e, "Failed to receive from bus");
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            }
        }

        // Final sweep so short-deadline batches retire before shutdown.
        self.sweep_expired().await?;
        info!("Batch aggregator stopped");
        Ok(())
    }

    /// Applies one event to the batch table.
    async fn handle_delivery(&mut self, delivery: Delivery) -> Result<(), SinkError> {
        let batch_id = delivery.envelope.batch_id;
        let correlation_id = delivery.envelope.correlation_id;

        // Late or duplicate event for a batch that already retired: the
        // records are on disk, so the event is acked and dropped.
        if self.retired.contains(&batch_id) {
            debug!(
                correlation_id = %correlation_id,
                batch_id = %batch_id,
                event_type = %delivery.envelope.event_type,
                "Discarding event for retired batch"
            );
            if let Err(e) = self.bus.ack(&delivery).await {
                warn!(correlation_id = %correlation_id, batch_id = %batch_id, error = %e, "Failed to ack late event");
            }
            return Ok(());
        }

        let batch_timeout = self.config.batch_timeout;
        let batch = self.batches.entry(batch_id).or_insert_with(|| {
            debug!(correlation_id = %correlation_id, batch_id = %batch_id, "Opening batch");
            OpenBatch::open(batch_id, correlation_id, batch_timeout)
        });

        match &delivery.envelope.payload {
            EventPayload::AnswerGenerated(payload) => {
                batch.upsert_answer(payload);
                debug!(
                    correlation_id = %correlation_id,
                    batch_id = %batch_id,
                    answer_id = %payload.answer_id,
                    answers = batch.answers.len(),
                    "Applied answer event"
                );
            }
            EventPayload::VerificationCompleted(scored) => {
                batch.upsert_score(scored);
                debug!(
                    correlation_id = %correlation_id,
                    batch_id = %batch_id,
                    answer_id = %scored.answer_id,
                    scores = batch.scores.len(),
                    "Applied verification event"
                );
            }
        }

        batch.deliveries.push(delivery);
        let complete = batch.is_complete();
        metrics::set_open_batches(self.batches.len());

        if complete {
            self.retire(batch_id, true).await?;
        }

        Ok(())
    }

    /// Retires every batch whose deadline has passed.
    async fn sweep_expired(&mut self) -> Result<(), SinkError> {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .batches
            .values()
            .filter(|b| b.is_expired(now))
            .map(|b| b.batch_id)
            .collect();

        for batch_id in expired {
            self.retire(batch_id, false).await?;
        }

        Ok(())
    }

    /// Retires one batch: emit SFT records, run DPO selection, ack leases,
    /// remember the batch id.
    async fn retire(&mut self, batch_id: Uuid, complete: bool) -> Result<(), SinkError> {
        let Some(batch) = self.batches.remove(&batch_id) else {
            return Ok(());
        };

        let correlation_id = batch.correlation_id;
        let joined = batch.joined();

        info!(
            correlation_id = %correlation_id,
            batch_id = %batch_id,
            complete,
            joined = joined.len(),
            answers = batch.answers.len(),
            scores = batch.scores.len(),
            "Retiring batch"
        );

        if let Some(context) = &batch.context {
            for candidate in &joined {
                let record = SftRecord {
                    question: context.question.clone(),
                    answer: candidate.answer.text.clone(),
                    contexts: context.contexts.clone(),
                    verification: SftVerification::from(&candidate.score),
                    metadata: SftMetadata {
                        batch_id,
                        candidate_index: candidate.answer.candidate_index,
                        sampling_params: candidate.answer.sampling_params.clone(),
                        judge_mode: candidate.score.judge_mode,
                    },
                    timestamp: Utc::now(),
                };
                self.sft_sink.append(&record).await?;
            }
            metrics::record_sft_records(joined.len());

            if joined.len() >= 2 {
                let candidates: Vec<PreferenceCandidate> = joined
                    .iter()
                    .map(|c| PreferenceCandidate {
                        answer_id: c.answer.answer_id,
                        candidate_index: c.answer.candidate_index,
                        text: c.answer.text.clone(),
                        faithfulness: c.score.faithfulness,
                        overall: c.score.overall,
                    })
                    .collect();

                match self.selector.select(
                    batch_id,
                    &context.question,
                    &context.contexts,
                    &candidates,
                ) {
                    Ok(record) => {
                        self.dpo_sink.append(&record).await?;
                        metrics::record_dpo_pair();
                        info!(
                            correlation_id = %correlation_id,
                            batch_id = %batch_id,
                            chosen_score = record.chosen.score,
                            rejected_score = record.rejected.score,
                            score_difference = record.score_difference,
                            "Emitted DPO pair"
                        );
                    }
                    Err(reason) => {
                        info!(
                            correlation_id = %correlation_id,
                            batch_id = %batch_id,
                            reason = %reason,
                            "DPO pair skipped"
                        );
                    }
                }
            } else {
                let reason = if complete {
                    SkipReason::InsufficientCandidates
                } else {
                    SkipReason::BatchTimedOut
                };
                self.selector.record_skip(reason);
                info!(
                    correlation_id = %correlation_id,
                    batch_id = %batch_id,
                    reason = %reason,
                    "DPO pair skipped"
                );
            }
        } else {
            // Only verifications arrived; with no answer event there is no
            // question or text to emit for.
            self.selector.record_skip(SkipReason::BatchTimedOut);
            warn!(
                correlation_id = %correlation_id,
                batch_id = %batch_id,
                scores = batch.scores.len(),
                "Batch expired without any answer event"
            );
        }

        // Records are durable; commit the leases.
        for delivery in &batch.deliveries {
            if let Err(e) = self.bus.ack(delivery).await {
                warn!(
                    correlation_id = %correlation_id,
                    batch_id = %batch_id,
                    error = %e,
                    "Failed to ack lease at retirement"
                );
            }
        }

        self.retired.insert(batch_id);
        metrics::set_open_batches(self.batches.len());
        let latency = (Utc::now() - batch.first_seen_at)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        metrics::record_batch_retired(complete, latency);

        Ok(())
    }
}
