//! LLM judge with defensive response parsing.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use super::{Judge, JudgeScores};
use crate::error::JudgeError;
use crate::llm::{ChatBackend, ChatRequest, Message};
use crate::retrieval::Passage;

/// Rubric prompt. The judge must answer with a bare JSON object so the
/// response survives the defensive parser below.
const JUDGE_PROMPT: &str = "You are a strict evaluator of retrieval-augmented answers.\n\n\
Question:\n{question}\n\n\
Context passages:\n{context}\n\n\
Answer to evaluate:\n{answer}\n\n\
Score the answer on two criteria, each a number between 0.0 and 1.0:\n\
- faithfulness: is every claim in the answer supported by the context passages?\n\
- relevancy: does the answer directly address the question?\n\n\
Respond with ONLY a JSON object of the form:\n\
{\"faithfulness\": <float>, \"relevancy\": <float>}";

/// Judge temperature is pinned low; rubric scoring should not be creative.
const JUDGE_TEMPERATURE: f64 = 0.0;

/// Completion budget for the judge's JSON reply.
const JUDGE_MAX_TOKENS: u32 = 128;

#[derive(Debug, Deserialize)]
struct RawScores {
    faithfulness: f64,
    relevancy: f64,
}

/// LLM-backed judge.
pub struct LlmJudge {
    backend: Arc<dyn ChatBackend>,
    model: String,
    call_timeout: Duration,
}

impl LlmJudge {
    /// Creates a judge over the given chat backend.
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        model: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            model: model.into(),
            call_timeout,
        }
    }

    fn render_prompt(question: &str, contexts: &[Passage], answer: &str) -> String {
        let context_text = contexts
            .iter()
            .enumerate()
            .map(|(i, p)| format!("[{}] {}", i + 1, p.text))
            .collect::<Vec<_>>()
            .join("\n");

        JUDGE_PROMPT
            .replace("{question}", question)
            .replace("{context}", &context_text)
            .replace("{answer}", answer)
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn judge(
        &self,
        question: &str,
        contexts: &[Passage],
        answer: &str,
    ) -> Result<JudgeScores, JudgeError> {
        let prompt = Self::render_prompt(question, contexts, answer);
        let request = ChatRequest::new(&self.model, vec![Message::user(prompt)])
            .with_temperature(JUDGE_TEMPERATURE)
            .with_max_tokens(JUDGE_MAX_TOKENS);

        let response = tokio::time::timeout(self.call_timeout, self.backend.complete(request))
            .await
            .map_err(|_| JudgeError::Timeout {
                seconds: self.call_timeout.as_secs(),
            })??;

        parse_judge_response(&response.text)
    }
}

/// Parses the judge's raw output into rubric scores.
///
/// Tries, in order: the whole response as JSON, the contents of a fenced
/// code block, and finally a regex scan for the two labeled numbers.
/// Scores outside [0, 1] are rejected so the caller falls back to the
/// heuristic path.
pub fn parse_judge_response(content: &str) -> Result<JudgeScores, JudgeError> {
    let trimmed = content.trim();

    if let Ok(raw) = serde_json::from_str::<RawScores>(trimmed) {
        return validate(raw);
    }

    if let Some(block) = extract_fenced_block(trimmed) {
        if let Ok(raw) = serde_json::from_str::<RawScores>(block.trim()) {
            return validate(raw);
        }
    }

    if let (Some(faithfulness), Some(relevancy)) = (
        extract_labeled_number(trimmed, "faithfulness"),
        extract_labeled_number(trimmed, "relevancy"),
    ) {
        return validate(RawScores {
            faithfulness,
            relevancy,
        });
    }

    Err(JudgeError::ParseError(format!(
        "no scores found in judge response: '{}'",
        truncate(trimmed, 120)
    )))
}

fn validate(raw: RawScores) -> Result<JudgeScores, JudgeError> {
    let in_range = |v: f64| (0.0..=1.0).contains(&v) && v.is_finite();
    if !in_range(raw.faithfulness) || !in_range(raw.relevancy) {
        return Err(JudgeError::OutOfRange {
            faithfulness: raw.faithfulness,
            relevancy: raw.relevancy,
        });
    }
    Ok(JudgeScores {
        faithfulness: raw.faithfulness,
        relevancy: raw.relevancy,
    })
}

fn extract_fenced_block(content: &str) -> Option<&str> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("fence regex is valid")
    });
    fence
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

fn extract_labeled_number(content: &str, label: &str) -> Option<f64> {
    let pattern = format!(r#"(?i)"?{}"?\s*[:=]\s*([0-9]*\.?[0-9]+)"#, label);
    let re = Regex::new(&pattern).ok()?;
    re.captures(content)?
        .get(1)?
        .as_str()
        .parse::<f64>()
        .ok()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
