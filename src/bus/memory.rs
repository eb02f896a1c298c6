//! In-process event bus with the same lease/ack semantics as the Redis bus.
//!
//! Used by the single-process `run` mode and by tests. Not durable across
//! restarts, but faithful to the at-least-once contract: leased messages
//! stay in a processing list until acked, delivery counts are tracked, and
//! over-delivered or malformed messages are dead-lettered.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{parse_envelope, BusError, BusRoutes, Delivery, EventBus, EventEnvelope};

/// How often a blocked receive re-checks the queue.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct GroupQueue {
    ready: VecDeque<String>,
    processing: Vec<String>,
    dead: Vec<(String, String)>,
    deliveries: HashMap<String, u32>,
}

/// In-memory event bus.
#[derive(Clone)]
pub struct InMemoryBus {
    routes: BusRoutes,
    queues: Arc<Mutex<HashMap<(String, String), GroupQueue>>>,
    max_deliveries: u32,
}

impl InMemoryBus {
    /// Creates a bus with the given routing table.
    pub fn new(routes: BusRoutes) -> Self {
        Self {
            routes,
            queues: Arc::new(Mutex::new(HashMap::new())),
            max_deliveries: super::DEFAULT_MAX_DELIVERIES,
        }
    }

    /// Sets the delivery cap before messages are dead-lettered.
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }

    /// Number of ready messages for a `(topic, group)` pair.
    pub async fn len(&self, topic: &str, group: &str) -> usize {
        let queues = self.queues.lock().await;
        queues
            .get(&(topic.to_string(), group.to_string()))
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Number of dead-lettered messages for a `(topic, group)` pair.
    pub async fn dead_letter_len(&self, topic: &str, group: &str) -> usize {
        let queues = self.queues.lock().await;
        queues
            .get(&(topic.to_string(), group.to_string()))
            .map(|q| q.dead.len())
            .unwrap_or(0)
    }

    /// Re-enqueues a raw message, bypassing routing. Test hook for
    /// exercising duplicate-delivery handling.
    pub async fn inject_raw(&self, topic: &str, group: &str, raw: impl Into<String>) {
        let mut queues = self.queues.lock().await;
        queues
            .entry((topic.to_string(), group.to_string()))
            .or_default()
            .ready
            .push_front(raw.into());
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), BusError> {
        let topic = envelope.topic();
        let groups = self
            .routes
            .groups_for(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;

        let serialized = serde_json::to_string(envelope)?;

        let mut queues = self.queues.lock().await;
        for group in groups {
            queues
                .entry((topic.to_string(), group.clone()))
                .or_default()
                .ready
                .push_front(serialized.clone());
        }

        Ok(())
    }

    async fn receive(
        &self,
        topic: &str,
        group: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BusError> {
        let key = (topic.to_string(), group.to_string());
        let deadline = Instant::now() + timeout;

        loop {
            let raw = {
                let mut queues = self.queues.lock().await;
                let queue = queues.entry(key.clone()).or_default();
                match queue.ready.pop_back() {
                    Some(raw) => {
                        queue.processing.push(raw.clone());
                        Some(raw)
                    }
                    None => None,
                }
            };

            if let Some(raw) = raw {
                let envelope = match parse_envelope(&raw) {
                    Ok(envelope) => envelope,
                    Err(reason) => {
                        tracing::error!(topic, group, %reason, "Malformed event, dead-lettering");
                        let mut queues = self.queues.lock().await;
                        let queue = queues.entry(key.clone()).or_default();
                        queue.processing.retain(|m| m != &raw);
                        queue.dead.push((raw, reason));
                        crate::metrics::record_dead_letter();
                        continue;
                    }
                };

                let attempt = {
                    let mut queues = self.queues.lock().await;
                    let queue = queues.entry(key.clone()).or_default();
                    let count = queue
                        .deliveries
                        .entry(envelope.event_id.to_string())
                        .or_insert(0);
                    *count += 1;
                    *count
                };

                if attempt > self.max_deliveries {
                    tracing::error!(
                        topic,
                        group,
                        event_id = %envelope.event_id,
                        correlation_id = %envelope.correlation_id,
                        batch_id = %envelope.batch_id,
                        attempt,
                        "Delivery cap exceeded, dead-lettering"
                    );
                    let mut queues = self.queues.lock().await;
                    let queue = queues.entry(key.clone()).or_default();
                    queue.processing.retain(|m| m != &raw);
                    queue
                        .deliveries
                        .remove(&envelope.event_id.to_string());
                    queue.dead.push((raw, "max deliveries exceeded".into()));
                    crate::metrics::record_dead_letter();
                    continue;
                }

                return Ok(Some(Delivery {
                    envelope,
                    raw,
                    topic: topic.to_string(),
                    group: group.to_string(),
                    attempt,
                }));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - Instant::now())).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .entry((delivery.topic.clone(), delivery.group.clone()))
            .or_default();

        if let Some(pos) = queue.processing.iter().position(|m| m == &delivery.raw) {
            queue.processing.remove(pos);
        }
        queue
            .deliveries
            .remove(&delivery.envelope.event_id.to_string());

        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BusError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .entry((delivery.topic.clone(), delivery.group.clone()))
            .or_default();

        if let Some(pos) = queue.processing.iter().position(|m| m == &delivery.raw) {
            queue.processing.remove(pos);
        }
        queue.dead.push((delivery.raw.clone(), reason.to_string()));
        crate::metrics::record_dead_letter();

        Ok(())
    }

    async fn recover(&self, topic: &str, group: &str) -> Result<usize, BusError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .entry((topic.to_string(), group.to_string()))
            .or_default();

        let recovered = queue.processing.len();
        for raw in queue.processing.drain(..) {
            queue.ready.push_back(raw);
        }

        Ok(recovered)
    }
}
