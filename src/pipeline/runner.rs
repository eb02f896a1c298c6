//! In-process pipeline wiring.
//!
//! Assembles orchestrator, verifier pool, aggregator, and sinks over any
//! bus and backend implementations. The `run` CLI mode uses this with the
//! in-memory bus and real backends; tests use it with scripted backends.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::error;

use crate::aggregator::{AggregatorConfig, BatchAggregator};
use crate::bus::EventBus;
use crate::error::SinkError;
use crate::generation::Generator;
use crate::orchestrator::{OrchestratorConfig, QaOrchestrator};
use crate::retrieval::Retriever;
use crate::selector::{DpoSelector, SelectorConfig, SelectorStats};
use crate::sink::JsonlSink;
use crate::verifier::{Judge, VerifierPool, VerifierPoolConfig};

use super::config::PipelineConfig;

/// A fully wired single-process pipeline.
pub struct Pipeline {
    orchestrator: Arc<QaOrchestrator>,
    selector: Arc<DpoSelector>,
    sft_sink: Arc<JsonlSink>,
    dpo_sink: Arc<JsonlSink>,
    verifier_pool: VerifierPool,
    aggregator_handle: JoinHandle<Result<(), SinkError>>,
    aggregator_shutdown: broadcast::Sender<()>,
}

impl Pipeline {
    /// Wires and starts all components over the given bus and backends.
    pub async fn start(
        config: &PipelineConfig,
        bus: Arc<dyn EventBus>,
        retriever: Arc<dyn Retriever>,
        generator: Arc<dyn Generator>,
        judge: Arc<dyn Judge>,
    ) -> Self {
        let selector = Arc::new(DpoSelector::new(SelectorConfig {
            min_score_diff: config.min_score_diff,
            min_chosen_score: config.min_chosen_score,
            enable_verbatim_gate: config.enable_verbatim_gate,
            enable_hedging_gate: config.enable_hedging_gate,
        }));

        let sft_sink = Arc::new(JsonlSink::training(&config.training_dir, config.sink_sync));
        let dpo_sink = Arc::new(JsonlSink::dpo(&config.dpo_dir, config.sink_sync));

        let orchestrator = Arc::new(QaOrchestrator::new(
            retriever,
            generator,
            Arc::clone(&bus),
            config.sampling_profiles.clone(),
            OrchestratorConfig {
                num_candidates: config.num_candidates,
                top_k: config.top_k,
                generation_concurrency: config.num_candidates.max(1),
            },
        ));

        let mut verifier_pool = VerifierPool::new(
            VerifierPoolConfig {
                num_workers: config.verifier_workers,
                judge_concurrency: config.judge_concurrency,
                ..VerifierPoolConfig::default()
            },
            Arc::clone(&bus),
            judge,
        );
        verifier_pool.start().await;

        let defaults = AggregatorConfig::default();
        let aggregator = BatchAggregator::new(
            AggregatorConfig {
                batch_timeout: config.batch_timeout,
                max_open_batches: config.max_open_batches,
                // Sweep at least twice per batch lifetime so short deadlines
                // retire promptly.
                sweep_interval: defaults.sweep_interval.min(config.batch_timeout / 2),
                ..defaults
            },
            bus,
            Arc::clone(&sft_sink),
            Arc::clone(&dpo_sink),
            Arc::clone(&selector),
        );
        let aggregator_shutdown = aggregator.shutdown_handle();
        let aggregator_handle = tokio::spawn(aggregator.run());

        Self {
            orchestrator,
            selector,
            sft_sink,
            dpo_sink,
            verifier_pool,
            aggregator_handle,
            aggregator_shutdown,
        }
    }

    /// The orchestrator for submitting questions.
    pub fn orchestrator(&self) -> &Arc<QaOrchestrator> {
        &self.orchestrator
    }

    /// The SFT sink.
    pub fn sft_sink(&self) -> &Arc<JsonlSink> {
        &self.sft_sink
    }

    /// The DPO sink.
    pub fn dpo_sink(&self) -> &Arc<JsonlSink> {
        &self.dpo_sink
    }

    /// Snapshot of the DPO acceptance statistics.
    pub fn selector_stats(&self) -> SelectorStats {
        self.selector.stats()
    }

    /// Stops the verifier pool and the aggregator, flushing sinks.
    pub async fn shutdown(mut self) {
        self.verifier_pool.shutdown().await;

        let _ = self.aggregator_shutdown.send(());
        match self.aggregator_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Aggregator halted on sink failure"),
            Err(e) => error!(error = %e, "Aggregator task panicked"),
        }

        if let Err(e) = self.sft_sink.flush().await {
            error!(error = %e, "Failed to flush SFT sink");
        }
        if let Err(e) = self.dpo_sink.flush().await {
            error!(error = %e, "Failed to flush DPO sink");
        }
    }
}
