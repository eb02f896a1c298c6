//! Prometheus metrics for pipeline observability.
//!
//! All metrics are registered once at startup via [`init_metrics`] and
//! recorded through the helper functions below. The helpers are no-ops
//! before initialization so library code can record unconditionally.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all prefforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Number of batches currently open in the aggregator.
pub static OPEN_BATCHES: OnceLock<Gauge> = OnceLock::new();

/// Total batches retired, labeled by outcome (`complete` / `timed_out`).
pub static BATCHES_RETIRED: OnceLock<CounterVec> = OnceLock::new();

/// Seconds from batch open to retirement.
pub static BATCH_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Total SFT records written.
pub static SFT_RECORDS: OnceLock<Counter> = OnceLock::new();

/// Total DPO pairs written.
pub static DPO_PAIRS: OnceLock<Counter> = OnceLock::new();

/// Total DPO skips, labeled by reason code.
pub static DPO_SKIPS: OnceLock<CounterVec> = OnceLock::new();

/// Total judge calls, labeled by mode (`llm` / `heuristic`).
pub static JUDGE_CALLS: OnceLock<CounterVec> = OnceLock::new();

/// Total falls from LLM judge to heuristic scoring.
pub static JUDGE_FALLBACKS: OnceLock<Counter> = OnceLock::new();

/// Total events parked in dead-letter lists.
pub static DEAD_LETTERS: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at application startup; a second call returns an error from
/// the `OnceLock` guards being already set.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let open_batches = Gauge::new(
        "prefforge_open_batches",
        "Number of batches currently open in the aggregator",
    )?;

    let batches_retired = CounterVec::new(
        Opts::new("prefforge_batches_retired_total", "Total batches retired"),
        &["outcome"],
    )?;

    let batch_latency = Histogram::with_opts(
        HistogramOpts::new(
            "prefforge_batch_latency_seconds",
            "Seconds from batch open to retirement",
        )
        .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0]),
    )?;

    let sft_records = Counter::new("prefforge_sft_records_total", "Total SFT records written")?;

    let dpo_pairs = Counter::new("prefforge_dpo_pairs_total", "Total DPO pairs written")?;

    let dpo_skips = CounterVec::new(
        Opts::new("prefforge_dpo_skips_total", "Total DPO skips by reason"),
        &["reason"],
    )?;

    let judge_calls = CounterVec::new(
        Opts::new("prefforge_judge_calls_total", "Total judge calls by mode"),
        &["mode"],
    )?;

    let judge_fallbacks = Counter::new(
        "prefforge_judge_fallbacks_total",
        "Total falls from LLM judge to heuristic scoring",
    )?;

    let dead_letters = Counter::new(
        "prefforge_dead_letters_total",
        "Total events parked in dead-letter lists",
    )?;

    registry.register(Box::new(open_batches.clone()))?;
    registry.register(Box::new(batches_retired.clone()))?;
    registry.register(Box::new(batch_latency.clone()))?;
    registry.register(Box::new(sft_records.clone()))?;
    registry.register(Box::new(dpo_pairs.clone()))?;
    registry.register(Box::new(dpo_skips.clone()))?;
    registry.register(Box::new(judge_calls.clone()))?;
    registry.register(Box::new(judge_fallbacks.clone()))?;
    registry.register(Box::new(dead_letters.clone()))?;

    let _ = OPEN_BATCHES.set(open_batches);
    let _ = BATCHES_RETIRED.set(batches_retired);
    let _ = BATCH_LATENCY.set(batch_latency);
    let _ = SFT_RECORDS.set(sft_records);
    let _ = DPO_PAIRS.set(dpo_pairs);
    let _ = DPO_SKIPS.set(dpo_skips);
    let _ = JUDGE_CALLS.set(judge_calls);
    let _ = JUDGE_FALLBACKS.set(judge_fallbacks);
    let _ = DEAD_LETTERS.set(dead_letters);
    let _ = REGISTRY.set(registry);

    Ok(())
}

/// Export all metrics in the Prometheus text exposition format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::new();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Sets the open-batches gauge.
pub fn set_open_batches(count: usize) {
    if let Some(gauge) = OPEN_BATCHES.get() {
        gauge.set(count as f64);
    }
}

/// Records a batch retirement and its latency.
pub fn record_batch_retired(complete: bool, latency_secs: f64) {
    if let Some(counter) = BATCHES_RETIRED.get() {
        let outcome = if complete { "complete" } else { "timed_out" };
        counter.with_label_values(&[outcome]).inc();
    }
    if let Some(histogram) = BATCH_LATENCY.get() {
        histogram.observe(latency_secs);
    }
}

/// Records SFT records written.
pub fn record_sft_records(count: usize) {
    if let Some(counter) = SFT_RECORDS.get() {
        counter.inc_by(count as f64);
    }
}

/// Records one DPO pair written.
pub fn record_dpo_pair() {
    if let Some(counter) = DPO_PAIRS.get() {
        counter.inc();
    }
}

/// Records one DPO skip by reason code.
pub fn record_dpo_skip(reason: &str) {
    if let Some(counter) = DPO_SKIPS.get() {
        counter.with_label_values(&[reason]).inc();
    }
}

/// Records one judge call by mode.
pub fn record_judge_call(mode: crate::verifier::JudgeMode) {
    if let Some(counter) = JUDGE_CALLS.get() {
        let label = match mode {
            crate::verifier::JudgeMode::Llm => "llm",
            crate::verifier::JudgeMode::Heuristic => "heuristic",
        };
        counter.with_label_values(&[label]).inc();
    }
}

/// Records one fall from LLM judge to heuristic scoring.
pub fn record_judge_fallback() {
    if let Some(counter) = JUDGE_FALLBACKS.get() {
        counter.inc();
    }
}

/// Records one dead-lettered event.
pub fn record_dead_letter() {
    if let Some(counter) = DEAD_LETTERS.get() {
        counter.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_before_init_is_noop() {
        // Must not panic even if init_metrics has not run in this process.
        set_open_batches(3);
        record_sft_records(2);
        record_dpo_skip("score_diff_too_small");
    }

    #[test]
    fn test_init_and_export() {
        // init may race with other tests in the same process; both orders
        // leave the registry usable.
        let _ = init_metrics();

        record_dpo_pair();
        record_batch_retired(true, 2.5);
        record_judge_fallback();

        let exported = export_metrics();
        assert!(exported.contains("prefforge_dpo_pairs_total"));
        assert!(exported.contains("prefforge_batches_retired_total"));
    }
}
