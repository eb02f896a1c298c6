//! End-to-end pipeline tests over the in-memory bus.
//!
//! Each test wires the full orchestrator -> verifier -> aggregator ->
//! sink path with scripted backends and asserts on the JSONL files the
//! pipeline leaves behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

use prefforge::bus::{
    AnswerGeneratedPayload, BusRoutes, EventBus, EventEnvelope, InMemoryBus,
};
use prefforge::error::{GenerationError, JudgeError, RetrievalError};
use prefforge::generation::{Generator, SamplingParams};
use prefforge::pipeline::{Pipeline, PipelineConfig};
use prefforge::retrieval::{Passage, Retriever};
use prefforge::sink::{DpoRecord, SftRecord, SyncPolicy};
use prefforge::verifier::{Judge, JudgeScores};

const QUESTION: &str = "What is a load balancer?";

const ANSWER_STRONG: &str = "A load balancer distributes incoming network traffic across \
multiple backend servers, using health checks to route requests only to healthy targets, \
which improves availability and responsiveness.";

const ANSWER_MEDIUM: &str = "It spreads requests across a pool of servers so that no \
single machine is overwhelmed by the incoming traffic.";

const ANSWER_WEAK: &str = "Networking has many devices; switches forward frames and \
routers forward packets between networks.";

fn contexts() -> Vec<Passage> {
    vec![
        Passage::new(
            "A load balancer distributes incoming network traffic across multiple backend \
             servers to improve availability and responsiveness.",
            "docs/lb.md#0",
            0.95,
        ),
        Passage::new(
            "Health checks let the load balancer detect unhealthy targets and stop routing \
             requests to them until they recover.",
            "docs/lb.md#1",
            0.88,
        ),
        Passage::new(
            "Round-robin and least-connections are common load balancing strategies.",
            "docs/lb.md#2",
            0.81,
        ),
    ]
}

struct ScriptedRetriever {
    passages: Vec<Passage>,
}

#[async_trait]
impl Retriever for ScriptedRetriever {
    async fn retrieve(&self, _question: &str, k: usize) -> Result<Vec<Passage>, RetrievalError> {
        Ok(self.passages.iter().take(k).cloned().collect())
    }
}

/// Generator answering by sampling temperature; slots whose temperature is
/// listed in `refuse` fail generation.
struct ScriptedGenerator {
    by_temperature: HashMap<String, String>,
    refuse: Vec<f64>,
}

impl ScriptedGenerator {
    fn new(answers: &[(f64, &str)]) -> Self {
        Self {
            by_temperature: answers
                .iter()
                .map(|(t, a)| (format!("{t:.2}"), a.to_string()))
                .collect(),
            refuse: Vec::new(),
        }
    }

    fn refusing(mut self, temperature: f64) -> Self {
        self.refuse.push(temperature);
        self
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        _question: &str,
        _contexts: &[Passage],
        params: &SamplingParams,
    ) -> Result<String, GenerationError> {
        if self.refuse.iter().any(|t| (t - params.temperature).abs() < 1e-9) {
            return Err(GenerationError::Refused("scripted refusal".into()));
        }
        self.by_temperature
            .get(&format!("{:.2}", params.temperature))
            .cloned()
            .ok_or(GenerationError::EmptyCompletion)
    }
}

/// Judge scoring by exact answer text.
struct ScriptedJudge {
    by_answer: HashMap<String, (f64, f64)>,
}

impl ScriptedJudge {
    fn new(scores: &[(&str, f64, f64)]) -> Self {
        Self {
            by_answer: scores
                .iter()
                .map(|(a, f, r)| (a.to_string(), (*f, *r)))
                .collect(),
        }
    }
}

#[async_trait]
impl Judge for ScriptedJudge {
    async fn judge(
        &self,
        _question: &str,
        _contexts: &[Passage],
        answer: &str,
    ) -> Result<JudgeScores, JudgeError> {
        let (faithfulness, relevancy) = self
            .by_answer
            .get(answer)
            .copied()
            .ok_or_else(|| JudgeError::ParseError(format!("unscripted answer: {answer}")))?;
        Ok(JudgeScores {
            faithfulness,
            relevancy,
        })
    }
}

/// Judge whose backend never answers.
struct DownJudge;

#[async_trait]
impl Judge for DownJudge {
    async fn judge(
        &self,
        _question: &str,
        _contexts: &[Passage],
        _answer: &str,
    ) -> Result<JudgeScores, JudgeError> {
        Err(JudgeError::Timeout { seconds: 60 })
    }
}

struct TestPipeline {
    pipeline: Pipeline,
    bus: Arc<InMemoryBus>,
    sft_dir: TempDir,
    dpo_dir: TempDir,
}

impl TestPipeline {
    async fn start(
        config_tweak: impl FnOnce(PipelineConfig) -> PipelineConfig,
        generator: ScriptedGenerator,
        judge: Arc<dyn Judge>,
    ) -> Self {
        let sft_dir = TempDir::new().expect("tempdir");
        let dpo_dir = TempDir::new().expect("tempdir");

        let config = config_tweak(
            PipelineConfig::default()
                .with_sink_sync(SyncPolicy::Every)
                .with_sink_dirs(sft_dir.path(), dpo_dir.path()),
        );

        let bus = Arc::new(InMemoryBus::new(BusRoutes::standard()));

        let pipeline = Pipeline::start(
            &config,
            bus.clone(),
            Arc::new(ScriptedRetriever {
                passages: contexts(),
            }),
            Arc::new(generator),
            judge,
        )
        .await;

        Self {
            pipeline,
            bus,
            sft_dir,
            dpo_dir,
        }
    }

    /// Reads back both streams, asserting every line parses as its schema.
    fn records(&self) -> (Vec<SftRecord>, Vec<DpoRecord>) {
        (
            read_records(self.sft_dir.path()),
            read_records(self.dpo_dir.path()),
        )
    }

    /// Polls until the SFT stream holds `count` records or the timeout hits.
    async fn wait_for_sft(&self, count: usize, timeout: Duration) {
        self.wait_for_counts(count, 0, timeout).await;
    }

    /// Polls until both streams hold at least the given record counts.
    async fn wait_for_counts(&self, sft: usize, dpo: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sft_records: Vec<SftRecord> = read_records(self.sft_dir.path());
            let dpo_records: Vec<DpoRecord> = read_records(self.dpo_dir.path());
            if sft_records.len() >= sft && dpo_records.len() >= dpo {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {sft} SFT / {dpo} DPO records, have {} / {}",
                sft_records.len(),
                dpo_records.len()
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn read_records<T: serde::de::DeserializeOwned>(dir: &std::path::Path) -> Vec<T> {
    let mut records = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.path().extension().is_some_and(|e| e == "jsonl") {
                let content = std::fs::read_to_string(entry.path()).expect("readable partition");
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    records.push(serde_json::from_str(line).expect("line parses as record"));
                }
            }
        }
    }
    records
}

#[tokio::test]
async fn happy_path_emits_three_sft_and_one_dpo() {
    let generator = ScriptedGenerator::new(&[
        (0.2, ANSWER_STRONG),
        (0.7, ANSWER_MEDIUM),
        (1.0, ANSWER_WEAK),
    ]);
    let judge = Arc::new(ScriptedJudge::new(&[
        (ANSWER_STRONG, 0.9, 0.9),
        (ANSWER_MEDIUM, 0.75, 0.75),
        (ANSWER_WEAK, 0.5, 0.4),
    ]));

    let harness = TestPipeline::start(|c| c, generator, judge).await;

    let response = harness
        .pipeline
        .orchestrator()
        .ask_multi(QUESTION, Some(3))
        .await
        .expect("ask_multi");
    assert_eq!(response.candidates.len(), 3);
    assert_eq!(response.events_published, 3);

    harness.wait_for_counts(3, 1, Duration::from_secs(10)).await;
    let (sft, dpo) = harness.records();

    assert_eq!(sft.len(), 3);
    for record in &sft {
        assert_eq!(record.question, QUESTION);
        assert_eq!(record.metadata.batch_id, response.batch_id);
        assert_eq!(record.contexts.len(), 3);
    }

    assert_eq!(dpo.len(), 1);
    let pair = &dpo[0];
    assert_eq!(pair.prompt, QUESTION);
    assert_eq!(pair.chosen.text, ANSWER_STRONG);
    assert_eq!(pair.rejected.text, ANSWER_WEAK);
    assert!((pair.chosen.score - 0.9).abs() < 1e-9);
    assert!((pair.rejected.score - 0.45).abs() < 1e-9);
    assert!((pair.score_difference - 0.45).abs() < 1e-9);

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn low_spread_skips_dpo() {
    let generator = ScriptedGenerator::new(&[
        (0.2, ANSWER_STRONG),
        (0.7, ANSWER_MEDIUM),
        (1.0, ANSWER_WEAK),
    ]);
    let judge = Arc::new(ScriptedJudge::new(&[
        (ANSWER_STRONG, 0.8, 0.8),
        (ANSWER_MEDIUM, 0.78, 0.79),
        (ANSWER_WEAK, 0.77, 0.78),
    ]));

    let harness = TestPipeline::start(|c| c, generator, judge).await;

    harness
        .pipeline
        .orchestrator()
        .ask_multi(QUESTION, Some(3))
        .await
        .expect("ask_multi");

    harness.wait_for_sft(3, Duration::from_secs(10)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let (sft, dpo) = harness.records();
    assert_eq!(sft.len(), 3);
    assert!(dpo.is_empty());

    let stats = harness.pipeline.selector_stats();
    assert_eq!(stats.created, 0);
    assert_eq!(stats.skipped["score_diff_too_small"], 1);

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn failed_generation_slot_shrinks_the_batch() {
    let generator = ScriptedGenerator::new(&[
        (0.2, ANSWER_STRONG),
        (0.7, ANSWER_MEDIUM),
        (1.0, ANSWER_WEAK),
    ])
    .refusing(0.7);
    let judge = Arc::new(ScriptedJudge::new(&[
        (ANSWER_STRONG, 0.9, 0.9),
        (ANSWER_WEAK, 0.5, 0.4),
    ]));

    let harness = TestPipeline::start(|c| c, generator, judge).await;

    let response = harness
        .pipeline
        .orchestrator()
        .ask_multi(QUESTION, Some(3))
        .await
        .expect("ask_multi");
    assert_eq!(response.candidates.len(), 2);

    harness.wait_for_counts(2, 1, Duration::from_secs(10)).await;
    let (sft, dpo) = harness.records();
    assert_eq!(sft.len(), 2);

    // The surviving pair still clears both score gates.
    assert_eq!(dpo.len(), 1);
    assert!(dpo[0].score_difference >= 0.3);
    assert!(dpo[0].chosen.score >= 0.7);

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn batch_timeout_retires_with_partial_scores() {
    let generator = ScriptedGenerator::new(&[
        (0.2, ANSWER_STRONG),
        (0.7, ANSWER_MEDIUM),
        (1.0, ANSWER_WEAK),
    ]);
    let judge = Arc::new(ScriptedJudge::new(&[
        (ANSWER_STRONG, 0.9, 0.9),
        (ANSWER_MEDIUM, 0.5, 0.4),
        (ANSWER_WEAK, 0.6, 0.6),
    ]));

    let harness = TestPipeline::start(
        |c| c.with_batch_timeout(Duration::from_millis(400)),
        generator,
        judge,
    )
    .await;

    harness
        .pipeline
        .orchestrator()
        .ask_multi(QUESTION, Some(3))
        .await
        .expect("ask_multi");

    // All three verifications normally land well before 400ms; whether the
    // batch completes or times out, it retires exactly once.
    harness.wait_for_sft(1, Duration::from_secs(10)).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let (sft, dpo) = harness.records();
    assert!(!sft.is_empty() && sft.len() <= 3);
    assert!(dpo.len() <= 1);

    harness.pipeline.shutdown().await;

    // No further records appear after shutdown: retirement happened once.
    let sft_after: Vec<SftRecord> = read_records(harness.sft_dir.path());
    let dpo_after: Vec<DpoRecord> = read_records(harness.dpo_dir.path());
    assert_eq!(sft.len(), sft_after.len());
    assert_eq!(dpo.len(), dpo_after.len());
}

#[tokio::test]
async fn duplicate_answer_event_collapses_to_one_sft_record() {
    let generator = ScriptedGenerator::new(&[(0.2, ANSWER_STRONG)]);
    let judge = Arc::new(ScriptedJudge::new(&[(ANSWER_STRONG, 0.9, 0.9)]));

    let harness = TestPipeline::start(|c| c, generator, judge).await;

    // Hand-publish the same envelope twice: an at-least-once bus may
    // deliver one event to each consumer group more than once.
    let envelope = EventEnvelope::answer_generated(
        Uuid::new_v4(),
        Uuid::new_v4(),
        AnswerGeneratedPayload {
            question: QUESTION.into(),
            answer: ANSWER_STRONG.into(),
            contexts: contexts(),
            expected_count: 1,
            candidate_index: 0,
            answer_id: Uuid::new_v4(),
            sampling_params: SamplingParams::with_temperature(0.2),
        },
    );
    harness.bus.publish(&envelope).await.expect("publish");
    harness.bus.publish(&envelope).await.expect("publish again");

    harness.wait_for_sft(1, Duration::from_secs(10)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (sft, dpo) = harness.records();
    assert_eq!(sft.len(), 1);
    assert!(dpo.is_empty());

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn judge_outage_falls_back_to_heuristic_scoring() {
    let generator = ScriptedGenerator::new(&[
        (0.2, ANSWER_STRONG),
        (0.7, ANSWER_MEDIUM),
        (1.0, ANSWER_WEAK),
    ]);

    let harness = TestPipeline::start(|c| c, generator, Arc::new(DownJudge)).await;

    harness
        .pipeline
        .orchestrator()
        .ask_multi(QUESTION, Some(3))
        .await
        .expect("ask_multi");

    // Each event retries the judge three times before falling back, so
    // give this scenario a little longer.
    harness.wait_for_sft(3, Duration::from_secs(20)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let (sft, dpo) = harness.records();

    assert_eq!(sft.len(), 3);
    let mut overalls = Vec::new();
    for record in &sft {
        let json = serde_json::to_value(record).expect("serialize");
        assert_eq!(json["metadata"]["judge_mode"], "heuristic");
        overalls.push(record.verification.overall);
    }

    // Substantively different answers must not collapse onto one score.
    for i in 0..overalls.len() {
        for j in (i + 1)..overalls.len() {
            assert!(
                (overalls[i] - overalls[j]).abs() >= 0.02,
                "heuristic scores too close: {} vs {}",
                overalls[i],
                overalls[j]
            );
        }
    }

    // A pair is emitted only if the heuristic scores cross the gates.
    for pair in &dpo {
        assert!(pair.score_difference >= 0.3);
        assert!(pair.chosen.score >= 0.7);
    }

    harness.pipeline.shutdown().await;
}
