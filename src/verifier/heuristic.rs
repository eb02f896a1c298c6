//! Deterministic fallback scorer.
//!
//! Used when the LLM judge is unavailable or returns garbage. The scoring
//! functions are continuous in the token composition of the answer so that
//! different candidates get measurably different scores; a fallback that
//! collapses every candidate to the same value would starve the DPO
//! selector of the variance it needs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use super::{Judge, JudgeScores};
use crate::error::JudgeError;
use crate::retrieval::Passage;

/// Common English stopwords excluded from faithfulness coverage.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "if",
    "in", "into", "is", "it", "its", "no", "not", "of", "on", "or", "such", "that", "the",
    "their", "then", "there", "these", "they", "this", "to", "was", "we", "were", "what",
    "when", "which", "will", "with", "you", "your",
];

/// Answers shorter than this many tokens are penalized as underdeveloped.
const MIN_HEALTHY_TOKENS: usize = 20;

/// Answers longer than this many tokens are penalized as rambling.
const MAX_HEALTHY_TOKENS: usize = 800;

/// Phrases that mark an evasive non-answer.
const HEDGING_PHRASES: &[&str] = &["don't know", "do not know", "cannot answer", "can't answer"];

/// Phrases that mark a partially evasive answer.
const SOFT_HEDGING_PHRASES: &[&str] = &["not mentioned", "not explicitly", "no information"];

/// Rule-based judge scoring by token overlap and answer shape.
#[derive(Debug, Clone, Default)]
pub struct HeuristicJudge;

impl HeuristicJudge {
    /// Creates a heuristic judge.
    pub fn new() -> Self {
        Self
    }

    /// Scores an answer without touching any backend.
    pub fn score(&self, question: &str, contexts: &[Passage], answer: &str) -> JudgeScores {
        let faithfulness = faithfulness_score(answer, contexts);
        let relevancy = relevancy_score(question, answer);
        JudgeScores {
            faithfulness,
            relevancy,
        }
    }
}

#[async_trait]
impl Judge for HeuristicJudge {
    async fn judge(
        &self,
        question: &str,
        contexts: &[Passage],
        answer: &str,
    ) -> Result<JudgeScores, JudgeError> {
        Ok(self.score(question, contexts, answer))
    }
}

/// Lowercased alphanumeric tokens.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Fraction of content tokens in the answer that appear in the contexts,
/// mapped piecewise onto [0.3, 1.0].
///
/// The map rewards high coverage steeply: above 50% coverage the answer is
/// considered well grounded, below 30% it is mostly unsupported.
fn faithfulness_score(answer: &str, contexts: &[Passage]) -> f64 {
    let answer_tokens: Vec<String> = tokenize(answer)
        .into_iter()
        .filter(|t| !is_stopword(t))
        .collect();

    if answer_tokens.is_empty() {
        return 0.3;
    }

    let context_tokens: HashSet<String> = contexts
        .iter()
        .flat_map(|p| tokenize(&p.text))
        .collect();

    let covered = answer_tokens
        .iter()
        .filter(|t| context_tokens.contains(*t))
        .count();
    let coverage = covered as f64 / answer_tokens.len() as f64;

    let score = if coverage > 0.5 {
        0.85 + (coverage - 0.5) * 0.3
    } else if coverage > 0.3 {
        0.65 + (coverage - 0.3) * 1.0
    } else {
        0.40 + coverage * 0.83
    };

    score.clamp(0.3, 1.0)
}

/// Cosine similarity over bag-of-words counts.
fn cosine_similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut counts_a: HashMap<&str, f64> = HashMap::new();
    for token in a {
        *counts_a.entry(token.as_str()).or_insert(0.0) += 1.0;
    }
    let mut counts_b: HashMap<&str, f64> = HashMap::new();
    for token in b {
        *counts_b.entry(token.as_str()).or_insert(0.0) += 1.0;
    }

    let dot: f64 = counts_a
        .iter()
        .filter_map(|(token, ca)| counts_b.get(token).map(|cb| ca * cb))
        .sum();
    let norm_a: f64 = counts_a.values().map(|c| c * c).sum::<f64>().sqrt();
    let norm_b: f64 = counts_b.values().map(|c| c * c).sum::<f64>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Question/answer similarity blended with a length-sanity factor,
/// specificity bonuses, and hedging penalties, clamped to [0.3, 1.0].
fn relevancy_score(question: &str, answer: &str) -> f64 {
    let question_tokens = tokenize(question);
    let answer_tokens = tokenize(answer);
    let answer_lower = answer.to_lowercase();

    let cosine = cosine_similarity(&question_tokens, &answer_tokens);
    let mut score = 0.4 + 0.35 * cosine;

    // Length sanity: penalize stubs and walls of text, reward substance.
    let n = answer_tokens.len();
    if n < MIN_HEALTHY_TOKENS {
        score -= 0.15 * (MIN_HEALTHY_TOKENS - n) as f64 / MIN_HEALTHY_TOKENS as f64;
    } else if n > MAX_HEALTHY_TOKENS {
        let excess = (n - MAX_HEALTHY_TOKENS) as f64 / MAX_HEALTHY_TOKENS as f64;
        score -= 0.15 * excess.min(1.0);
    } else {
        score += 0.15 * (n as f64 / 200.0).min(1.0);
    }

    // Specificity: concrete numbers and technical vocabulary.
    if answer.chars().any(|c| c.is_ascii_digit()) {
        score += 0.05;
    }
    if answer_tokens.iter().filter(|t| t.len() > 8).count() > 3 {
        score += 0.05;
    }

    // Hedging: evasive answers are not relevant answers.
    if HEDGING_PHRASES.iter().any(|p| answer_lower.contains(p)) {
        score -= 0.30;
    } else if SOFT_HEDGING_PHRASES.iter().any(|p| answer_lower.contains(p)) {
        score -= 0.15;
    }

    score.clamp(0.3, 1.0)
}
