//! Durable topic-routed event transport.
//!
//! The bus contract is at-least-once delivery with explicit acknowledgement:
//!
//! - `publish` fans an envelope out to every consumer group registered for
//!   its topic
//! - `receive` leases the next message for a `(topic, group)` pair; the
//!   message stays in a per-group processing list until acked
//! - `ack` retires a leased message; unacked messages survive crashes and
//!   are replayed by `recover`
//! - messages delivered more than `max_deliveries` times are parked in a
//!   dead-letter list for inspection
//!
//! Ordering across candidates is not guaranteed; consumers group by
//! `batch_id` and rely on completion predicates instead of arrival order.

mod envelope;
mod memory;
mod redis;

pub use envelope::{
    AnswerGeneratedPayload, EventEnvelope, EventPayload, EventType, TOPIC_ANSWER_GENERATED,
    TOPIC_VERIFICATION_COMPLETED,
};
pub use memory::InMemoryBus;
pub use redis::RedisEventBus;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Default number of deliveries before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// Consumer group of the verifier workers.
pub const GROUP_VERIFIER: &str = "verifier";

/// Consumer group of the batch aggregator.
pub const GROUP_AGGREGATOR: &str = "aggregator";

/// Errors that can occur during bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Bus operation failed: {0}")]
    OperationFailed(String),

    #[error("Publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No route registered for topic '{0}'")]
    UnknownTopic(String),
}

/// A leased message: the parsed envelope plus the bookkeeping needed to
/// ack or dead-letter it later.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The parsed event.
    pub envelope: EventEnvelope,
    /// Exact serialized form, used to remove the message from its
    /// processing list on ack.
    pub raw: String,
    /// Topic the message was consumed from.
    pub topic: String,
    /// Consumer group that leased the message.
    pub group: String,
    /// How many times this message has been delivered, including this one.
    pub attempt: u32,
}

/// Static routing table: which consumer groups receive each topic.
#[derive(Debug, Clone)]
pub struct BusRoutes {
    routes: Vec<(String, Vec<String>)>,
}

impl BusRoutes {
    /// Creates an empty routing table.
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Registers the consumer groups for a topic.
    pub fn route(mut self, topic: impl Into<String>, groups: &[&str]) -> Self {
        self.routes
            .push((topic.into(), groups.iter().map(|g| g.to_string()).collect()));
        self
    }

    /// The pipeline's standard routing: verifier and aggregator both
    /// consume `answer.generated`; only the aggregator consumes
    /// `verification.completed`.
    pub fn standard() -> Self {
        Self::new()
            .route(TOPIC_ANSWER_GENERATED, &[GROUP_VERIFIER, GROUP_AGGREGATOR])
            .route(TOPIC_VERIFICATION_COMPLETED, &[GROUP_AGGREGATOR])
    }

    /// Returns the groups registered for `topic`, if any.
    pub fn groups_for(&self, topic: &str) -> Option<&[String]> {
        self.routes
            .iter()
            .find(|(t, _)| t == topic)
            .map(|(_, groups)| groups.as_slice())
    }
}

impl Default for BusRoutes {
    fn default() -> Self {
        Self::standard()
    }
}

/// Trait for durable topic-routed event transport.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes an envelope to every group registered for its topic.
    /// The envelope's `batch_id` acts as the grouping key.
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), BusError>;

    /// Leases the next message for `(topic, group)`, waiting up to
    /// `timeout`. Returns `Ok(None)` if no message arrived in time.
    ///
    /// Messages that fail to parse, or that have exceeded the delivery
    /// cap, are dead-lettered internally and never returned.
    async fn receive(
        &self,
        topic: &str,
        group: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BusError>;

    /// Acknowledges a leased message, removing it from the processing list.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Parks a leased message in the dead-letter list with a reason.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BusError>;

    /// Moves messages stuck in the `(topic, group)` processing list back to
    /// the ready list. Called on consumer startup for crash recovery.
    /// Returns the number of messages recovered.
    async fn recover(&self, topic: &str, group: &str) -> Result<usize, BusError>;
}

/// Parses a raw message into an envelope, surfacing the correlation id for
/// logging even when the full parse fails.
pub(crate) fn parse_envelope(raw: &str) -> Result<EventEnvelope, String> {
    match serde_json::from_str::<EventEnvelope>(raw) {
        Ok(envelope) => Ok(envelope),
        Err(e) => {
            // Best-effort correlation id extraction for the error path.
            let correlation_id = serde_json::from_str::<serde_json::Value>(raw)
                .ok()
                .and_then(|v| {
                    v.get("correlation_id")
                        .and_then(|c| c.as_str())
                        .map(String::from)
                })
                .unwrap_or_else(|| "unknown".to_string());
            Err(format!("correlation_id={}: {}", correlation_id, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_routes() {
        let routes = BusRoutes::standard();

        let answer_groups = routes
            .groups_for(TOPIC_ANSWER_GENERATED)
            .expect("route exists");
        assert_eq!(answer_groups, &["verifier", "aggregator"]);

        let verification_groups = routes
            .groups_for(TOPIC_VERIFICATION_COMPLETED)
            .expect("route exists");
        assert_eq!(verification_groups, &["aggregator"]);

        assert!(routes.groups_for("unknown.topic").is_none());
    }

    #[test]
    fn test_parse_envelope_reports_correlation_id() {
        let raw = r#"{"correlation_id": "11111111-2222-3333-4444-555555555555", "garbage": true}"#;
        let err = parse_envelope(raw).expect_err("should fail to parse");
        assert!(err.contains("11111111-2222-3333-4444-555555555555"));
    }

    #[test]
    fn test_parse_envelope_garbage() {
        let err = parse_envelope("not json at all").expect_err("should fail");
        assert!(err.contains("unknown"));
    }
}
