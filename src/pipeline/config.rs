//! Pipeline configuration.
//!
//! One flat configuration struct covering candidate generation, the DPO
//! gates, aggregation limits, backend endpoints, and sink behavior, with
//! environment-variable loading and validation.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::generation::SamplingSchedule;
use crate::sink::SyncPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the preference data pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Candidate generation
    /// Default number of candidates per question.
    pub num_candidates: usize,
    /// Sampling profile schedule; candidate `i` uses profile `i % len`.
    pub sampling_profiles: SamplingSchedule,
    /// Passages retrieved per question.
    pub top_k: usize,

    // DPO gates
    /// Minimum `chosen - rejected` overall score difference.
    pub min_score_diff: f64,
    /// Minimum overall score for the chosen answer.
    pub min_chosen_score: f64,
    /// Reject chosen answers that are near-verbatim context copies.
    pub enable_verbatim_gate: bool,
    /// Reject chosen answers that hedge.
    pub enable_hedging_gate: bool,

    // Aggregation
    /// How long a batch may stay open.
    pub batch_timeout: Duration,
    /// Open-batch cap; consumption pauses above it.
    pub max_open_batches: usize,

    // Verification
    /// Maximum concurrent judge calls.
    pub judge_concurrency: usize,
    /// Number of verifier worker tasks.
    pub verifier_workers: usize,

    // Backends
    /// Redis connection URL for the event bus.
    pub redis_url: String,
    /// Base URL of the retrieval service.
    pub retriever_url: String,
    /// Model used for candidate generation.
    pub llm_model: String,
    /// Model used for judge scoring.
    pub judge_model: String,

    // Timeouts
    /// Per-call retrieval timeout.
    pub retrieval_timeout: Duration,
    /// Per-call generation timeout.
    pub generation_timeout: Duration,
    /// Per-call judge timeout.
    pub judge_timeout: Duration,
    /// Per-publish bus timeout.
    pub publish_timeout: Duration,

    // Sinks
    /// fsync policy for both sinks.
    pub sink_sync: SyncPolicy,
    /// Directory for SFT partitions.
    pub training_dir: PathBuf,
    /// Directory for DPO partitions.
    pub dpo_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_candidates: 3,
            sampling_profiles: SamplingSchedule::default(),
            top_k: 5,

            min_score_diff: 0.3,
            min_chosen_score: 0.7,
            enable_verbatim_gate: true,
            enable_hedging_gate: true,

            batch_timeout: Duration::from_secs(30 * 60),
            max_open_batches: 10_000,

            judge_concurrency: 4,
            verifier_workers: 2,

            redis_url: "redis://localhost:6379".to_string(),
            retriever_url: "http://localhost:6333".to_string(),
            llm_model: "llama3.2:3b".to_string(),
            judge_model: "llama3.2:3b".to_string(),

            retrieval_timeout: Duration::from_secs(5),
            generation_timeout: Duration::from_secs(60),
            judge_timeout: Duration::from_secs(60),
            publish_timeout: Duration::from_secs(2),

            sink_sync: SyncPolicy::Every,
            training_dir: PathBuf::from("./data/training_data"),
            dpo_dir: PathBuf::from("./data/dpo_data"),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PREFFORGE_NUM_CANDIDATES`: candidates per question (default: 3)
    /// - `PREFFORGE_SAMPLING_PROFILES`: comma-separated `temp[:top_p]` list
    /// - `PREFFORGE_TOP_K`: passages retrieved per question (default: 5)
    /// - `PREFFORGE_MIN_SCORE_DIFF`: DPO spread gate (default: 0.3)
    /// - `PREFFORGE_MIN_CHOSEN_SCORE`: DPO chosen gate (default: 0.7)
    /// - `PREFFORGE_ENABLE_VERBATIM_GATE`: verbatim-copy gate (default: true)
    /// - `PREFFORGE_ENABLE_HEDGING_GATE`: hedging gate (default: true)
    /// - `PREFFORGE_BATCH_TIMEOUT_SECS`: aggregator deadline (default: 1800)
    /// - `PREFFORGE_MAX_OPEN_BATCHES`: backpressure cap (default: 10000)
    /// - `PREFFORGE_JUDGE_CONCURRENCY`: judge semaphore (default: 4)
    /// - `PREFFORGE_VERIFIER_WORKERS`: verifier tasks (default: 2)
    /// - `REDIS_URL`: event bus connection (default: redis://localhost:6379)
    /// - `RETRIEVER_URL`: retrieval service base URL
    /// - `LLM_MODEL` / `JUDGE_MODEL`: model identifiers
    /// - `PREFFORGE_RETRIEVAL_TIMEOUT_SECS` / `PREFFORGE_GENERATION_TIMEOUT_SECS`
    ///   / `PREFFORGE_JUDGE_TIMEOUT_SECS` / `PREFFORGE_PUBLISH_TIMEOUT_SECS`
    /// - `PREFFORGE_SINK_SYNC`: `every`, `batch[:N]`, or `off` (default: every)
    /// - `PREFFORGE_TRAINING_DIR` / `PREFFORGE_DPO_DIR`: sink directories
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PREFFORGE_NUM_CANDIDATES") {
            config.num_candidates = parse_env_value(&val, "PREFFORGE_NUM_CANDIDATES")?;
        }

        if let Ok(val) = std::env::var("PREFFORGE_SAMPLING_PROFILES") {
            config.sampling_profiles =
                SamplingSchedule::parse(&val).ok_or_else(|| ConfigError::InvalidValue {
                    key: "PREFFORGE_SAMPLING_PROFILES".to_string(),
                    message: format!("could not parse '{}'", val),
                })?;
        }

        if let Ok(val) = std::env::var("PREFFORGE_TOP_K") {
            config.top_k = parse_env_value(&val, "PREFFORGE_TOP_K")?;
        }

        if let Ok(val) = std::env::var("PREFFORGE_MIN_SCORE_DIFF") {
            config.min_score_diff = parse_env_value(&val, "PREFFORGE_MIN_SCORE_DIFF")?;
        }

        if let Ok(val) = std::env::var("PREFFORGE_MIN_CHOSEN_SCORE") {
            config.min_chosen_score = parse_env_value(&val, "PREFFORGE_MIN_CHOSEN_SCORE")?;
        }

        if let Ok(val) = std::env::var("PREFFORGE_ENABLE_VERBATIM_GATE") {
            config.enable_verbatim_gate = parse_env_bool(&val, "PREFFORGE_ENABLE_VERBATIM_GATE")?;
        }

        if let Ok(val) = std::env::var("PREFFORGE_ENABLE_HEDGING_GATE") {
            config.enable_hedging_gate = parse_env_bool(&val, "PREFFORGE_ENABLE_HEDGING_GATE")?;
        }

        if let Ok(val) = std::env::var("PREFFORGE_BATCH_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PREFFORGE_BATCH_TIMEOUT_SECS")?;
            config.batch_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("PREFFORGE_MAX_OPEN_BATCHES") {
            config.max_open_batches = parse_env_value(&val, "PREFFORGE_MAX_OPEN_BATCHES")?;
        }

        if let Ok(val) = std::env::var("PREFFORGE_JUDGE_CONCURRENCY") {
            config.judge_concurrency = parse_env_value(&val, "PREFFORGE_JUDGE_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("PREFFORGE_VERIFIER_WORKERS") {
            config.verifier_workers = parse_env_value(&val, "PREFFORGE_VERIFIER_WORKERS")?;
        }

        if let Ok(val) = std::env::var("REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("RETRIEVER_URL") {
            config.retriever_url = val;
        }

        if let Ok(val) = std::env::var("LLM_MODEL") {
            config.llm_model = val;
        }

        if let Ok(val) = std::env::var("JUDGE_MODEL") {
            config.judge_model = val;
        }

        if let Ok(val) = std::env::var("PREFFORGE_RETRIEVAL_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PREFFORGE_RETRIEVAL_TIMEOUT_SECS")?;
            config.retrieval_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("PREFFORGE_GENERATION_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PREFFORGE_GENERATION_TIMEOUT_SECS")?;
            config.generation_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("PREFFORGE_JUDGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PREFFORGE_JUDGE_TIMEOUT_SECS")?;
            config.judge_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("PREFFORGE_PUBLISH_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PREFFORGE_PUBLISH_TIMEOUT_SECS")?;
            config.publish_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("PREFFORGE_SINK_SYNC") {
            config.sink_sync = SyncPolicy::parse(&val).ok_or_else(|| ConfigError::InvalidValue {
                key: "PREFFORGE_SINK_SYNC".to_string(),
                message: format!("expected every|batch[:N]|off, got '{}'", val),
            })?;
        }

        if let Ok(val) = std::env::var("PREFFORGE_TRAINING_DIR") {
            config.training_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("PREFFORGE_DPO_DIR") {
            config.dpo_dir = PathBuf::from(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_candidates == 0 || self.num_candidates > crate::orchestrator::MAX_CANDIDATES {
            return Err(ConfigError::ValidationFailed(format!(
                "num_candidates must be between 1 and {}",
                crate::orchestrator::MAX_CANDIDATES
            )));
        }

        if self.top_k == 0 {
            return Err(ConfigError::ValidationFailed(
                "top_k must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.min_score_diff) {
            return Err(ConfigError::ValidationFailed(
                "min_score_diff must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.min_chosen_score) {
            return Err(ConfigError::ValidationFailed(
                "min_chosen_score must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.batch_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_open_batches == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_open_batches must be greater than 0".to_string(),
            ));
        }

        if self.judge_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "judge_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.verifier_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "verifier_workers must be greater than 0".to_string(),
            ));
        }

        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.training_dir.as_os_str().is_empty() || self.dpo_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "sink directories cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the candidate count.
    pub fn with_num_candidates(mut self, n: usize) -> Self {
        self.num_candidates = n;
        self
    }

    /// Builder method to set the sampling schedule.
    pub fn with_sampling_profiles(mut self, schedule: SamplingSchedule) -> Self {
        self.sampling_profiles = schedule;
        self
    }

    /// Builder method to set the DPO spread gate.
    pub fn with_min_score_diff(mut self, diff: f64) -> Self {
        self.min_score_diff = diff;
        self
    }

    /// Builder method to set the DPO chosen gate.
    pub fn with_min_chosen_score(mut self, score: f64) -> Self {
        self.min_chosen_score = score;
        self
    }

    /// Builder method to enable or disable the verbatim gate.
    pub fn with_verbatim_gate(mut self, enabled: bool) -> Self {
        self.enable_verbatim_gate = enabled;
        self
    }

    /// Builder method to set the batch timeout.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    /// Builder method to set the sink sync policy.
    pub fn with_sink_sync(mut self, sync: SyncPolicy) -> Self {
        self.sink_sync = sync;
        self
    }

    /// Builder method to set the sink directories.
    pub fn with_sink_dirs(
        mut self,
        training_dir: impl Into<PathBuf>,
        dpo_dir: impl Into<PathBuf>,
    ) -> Self {
        self.training_dir = training_dir.into();
        self.dpo_dir = dpo_dir.into();
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.num_candidates, 3);
        assert_eq!(config.sampling_profiles.len(), 3);
        assert!((config.min_score_diff - 0.3).abs() < f64::EPSILON);
        assert!((config.min_chosen_score - 0.7).abs() < f64::EPSILON);
        assert!(config.enable_verbatim_gate);
        assert_eq!(config.batch_timeout, Duration::from_secs(1800));
        assert_eq!(config.max_open_batches, 10_000);
        assert_eq!(config.judge_concurrency, 4);
        assert_eq!(config.sink_sync, SyncPolicy::Every);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_num_candidates(5)
            .with_min_score_diff(0.2)
            .with_min_chosen_score(0.8)
            .with_verbatim_gate(false)
            .with_batch_timeout(Duration::from_secs(60))
            .with_sink_sync(SyncPolicy::Off)
            .with_sink_dirs("/tmp/sft", "/tmp/dpo");

        assert_eq!(config.num_candidates, 5);
        assert!((config.min_score_diff - 0.2).abs() < f64::EPSILON);
        assert!(!config.enable_verbatim_gate);
        assert_eq!(config.batch_timeout, Duration::from_secs(60));
        assert_eq!(config.training_dir, PathBuf::from("/tmp/sft"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_candidates() {
        let config = PipelineConfig::default().with_num_candidates(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_oversized_batch() {
        let config = PipelineConfig::default().with_num_candidates(9);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("num_candidates"));
    }

    #[test]
    fn test_validation_rejects_bad_gates() {
        let config = PipelineConfig::default().with_min_score_diff(1.5);
        assert!(config.validate().is_err());

        let config = PipelineConfig::default().with_min_chosen_score(-0.1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let config = PipelineConfig::default().with_batch_timeout(Duration::from_secs(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("1", "test").unwrap());
        assert!(parse_env_bool("ON", "test").unwrap());
        assert!(!parse_env_bool("false", "test").unwrap());
        assert!(!parse_env_bool("no", "test").unwrap());
        assert!(parse_env_bool("maybe", "test").is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "KEY".to_string(),
            message: "bad value".to_string(),
        };
        assert!(err.to_string().contains("KEY"));

        let err = ConfigError::ValidationFailed("test failure".to_string());
        assert!(err.to_string().contains("test failure"));
    }
}
