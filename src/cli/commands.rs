//! CLI command definitions and handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::aggregator::{AggregatorConfig, BatchAggregator};
use crate::bus::{BusRoutes, EventBus, InMemoryBus, RedisEventBus};
use crate::generation::LlmGenerator;
use crate::llm::ChatClient;
use crate::orchestrator::QaOrchestrator;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::retrieval::HttpRetriever;
use crate::selector::{DpoSelector, SelectorConfig};
use crate::sink::JsonlSink;
use crate::verifier::{HeuristicJudge, Judge, LlmJudge, VerifierPool, VerifierPoolConfig};

/// Retrieval-augmented preference data pipeline.
#[derive(Debug, Parser)]
#[command(name = "prefforge", version, about)]
pub struct Cli {
    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ask a question and publish a multi-candidate batch.
    Ask {
        /// The question to answer.
        question: String,

        /// Number of candidates to generate (defaults to config).
        #[arg(long)]
        candidates: Option<usize>,

        /// Generate a single answer without publishing any events.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run the verifier worker until interrupted.
    VerifyWorker {
        /// Score with the heuristic judge only (no LLM backend needed).
        #[arg(long)]
        heuristic_only: bool,
    },

    /// Run the batch aggregator until interrupted.
    AggregateWorker,

    /// Run the whole pipeline in one process over an in-memory bus.
    Run {
        /// Questions to push through the pipeline.
        #[arg(required = true)]
        questions: Vec<String>,

        /// Seconds to let batches settle before shutting down.
        #[arg(long, default_value_t = 15)]
        settle_secs: u64,
    },

    /// Print sink statistics as JSON.
    Stats,
}

/// Parses the command line.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Dispatches a parsed command line.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("loading configuration")?;

    match cli.command {
        Command::Ask {
            question,
            candidates,
            dry_run,
        } => ask(&config, &question, candidates, dry_run).await,
        Command::VerifyWorker { heuristic_only } => verify_worker(&config, heuristic_only).await,
        Command::AggregateWorker => aggregate_worker(&config).await,
        Command::Run {
            questions,
            settle_secs,
        } => run_pipeline(&config, &questions, settle_secs).await,
        Command::Stats => stats(&config),
    }
}

async fn redis_bus(config: &PipelineConfig) -> anyhow::Result<Arc<RedisEventBus>> {
    let bus = RedisEventBus::connect(&config.redis_url, BusRoutes::standard())
        .await
        .context("connecting to the event bus")?
        .with_publish_timeout(config.publish_timeout);
    Ok(Arc::new(bus))
}

fn retriever(config: &PipelineConfig) -> Arc<HttpRetriever> {
    Arc::new(HttpRetriever::new(
        &config.retriever_url,
        config.retrieval_timeout,
    ))
}

fn generator(config: &PipelineConfig) -> anyhow::Result<Arc<LlmGenerator>> {
    let client = Arc::new(ChatClient::from_env().context("configuring the LLM client")?);
    Ok(Arc::new(LlmGenerator::new(
        client,
        &config.llm_model,
        config.generation_timeout,
    )))
}

fn llm_judge(config: &PipelineConfig) -> anyhow::Result<Arc<LlmJudge>> {
    let client = Arc::new(ChatClient::from_env().context("configuring the judge client")?);
    Ok(Arc::new(LlmJudge::new(
        client,
        &config.judge_model,
        config.judge_timeout,
    )))
}

async fn ask(
    config: &PipelineConfig,
    question: &str,
    candidates: Option<usize>,
    dry_run: bool,
) -> anyhow::Result<()> {
    // A dry run never touches the bus; skip the Redis connection.
    let bus: Arc<dyn EventBus> = if dry_run {
        Arc::new(InMemoryBus::new(BusRoutes::standard()))
    } else {
        redis_bus(config).await?
    };
    let orchestrator = QaOrchestrator::new(
        retriever(config),
        generator(config)?,
        bus,
        config.sampling_profiles.clone(),
        crate::orchestrator::OrchestratorConfig {
            num_candidates: config.num_candidates,
            top_k: config.top_k,
            generation_concurrency: config.num_candidates.max(1),
        },
    );

    if dry_run {
        let response = orchestrator.ask(question, false).await?;
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        let response = orchestrator.ask_multi(question, candidates).await?;
        println!("{}", serde_json::to_string_pretty(&response)?);
    }

    Ok(())
}

async fn verify_worker(config: &PipelineConfig, heuristic_only: bool) -> anyhow::Result<()> {
    let bus = redis_bus(config).await?;

    let judge: Arc<dyn Judge> = if heuristic_only {
        Arc::new(HeuristicJudge::new())
    } else {
        llm_judge(config)?
    };

    let mut pool = VerifierPool::new(
        VerifierPoolConfig {
            num_workers: config.verifier_workers,
            judge_concurrency: config.judge_concurrency,
            ..VerifierPoolConfig::default()
        },
        bus,
        judge,
    );
    pool.start().await;

    info!("Verifier running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    pool.shutdown().await;

    Ok(())
}

async fn aggregate_worker(config: &PipelineConfig) -> anyhow::Result<()> {
    let bus = redis_bus(config).await?;

    let selector = Arc::new(DpoSelector::new(SelectorConfig {
        min_score_diff: config.min_score_diff,
        min_chosen_score: config.min_chosen_score,
        enable_verbatim_gate: config.enable_verbatim_gate,
        enable_hedging_gate: config.enable_hedging_gate,
    }));
    let sft_sink = Arc::new(JsonlSink::training(&config.training_dir, config.sink_sync));
    let dpo_sink = Arc::new(JsonlSink::dpo(&config.dpo_dir, config.sink_sync));

    let aggregator = BatchAggregator::new(
        AggregatorConfig {
            batch_timeout: config.batch_timeout,
            max_open_batches: config.max_open_batches,
            ..AggregatorConfig::default()
        },
        bus,
        Arc::clone(&sft_sink),
        Arc::clone(&dpo_sink),
        Arc::clone(&selector),
    );

    let shutdown = aggregator.shutdown_handle();
    let handle = tokio::spawn(aggregator.run());

    info!("Aggregator running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    let _ = shutdown.send(());
    handle.await?.context("aggregator halted")?;

    sft_sink.flush().await?;
    dpo_sink.flush().await?;
    println!("{}", serde_json::to_string_pretty(&selector.stats())?);

    Ok(())
}

async fn run_pipeline(
    config: &PipelineConfig,
    questions: &[String],
    settle_secs: u64,
) -> anyhow::Result<()> {
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(BusRoutes::standard()));

    let pipeline = Pipeline::start(
        config,
        bus,
        retriever(config),
        generator(config)?,
        llm_judge(config)?,
    )
    .await;

    for question in questions {
        let response = pipeline
            .orchestrator()
            .ask_multi(question, None)
            .await
            .with_context(|| format!("asking '{}'", question))?;
        info!(
            batch_id = %response.batch_id,
            correlation_id = %response.correlation_id,
            candidates = response.candidates.len(),
            "Submitted question"
        );
    }

    info!(settle_secs, "Waiting for batches to settle");
    tokio::time::sleep(Duration::from_secs(settle_secs)).await;

    let selector_stats = pipeline.selector_stats();
    pipeline.shutdown().await;

    let report = serde_json::json!({
        "sft": pipeline_stats(&config.training_dir, crate::sink::SFT_PREFIX, config)?,
        "dpo": pipeline_stats(&config.dpo_dir, crate::sink::DPO_PREFIX, config)?,
        "selector": selector_stats,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

fn stats(config: &PipelineConfig) -> anyhow::Result<()> {
    let report = serde_json::json!({
        "sft": pipeline_stats(&config.training_dir, crate::sink::SFT_PREFIX, config)?,
        "dpo": pipeline_stats(&config.dpo_dir, crate::sink::DPO_PREFIX, config)?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn pipeline_stats(
    dir: &std::path::Path,
    prefix: &str,
    config: &PipelineConfig,
) -> anyhow::Result<crate::sink::SinkStats> {
    let sink = JsonlSink::new(dir, prefix, config.sink_sync);
    Ok(sink.stats()?)
}
