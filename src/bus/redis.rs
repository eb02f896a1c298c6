//! Redis-backed event bus with reliable consume.
//!
//! Topic fan-out is materialized at publish time: each `(topic, group)`
//! pair gets its own Redis list, and a publish pushes the envelope to the
//! list of every group registered for the topic. Consumption uses
//! BRPOPLPUSH into a per-group processing list so a crashed consumer's
//! leases can be recovered, mirroring the reliable-queue pattern.
//!
//! Keys per `(topic, group)`:
//!
//! - `prefforge:{topic}:{group}`: ready list
//! - `prefforge:{topic}:{group}:processing`: leased messages
//! - `prefforge:{topic}:{group}:dead`: dead-letter list
//! - `prefforge:{topic}:{group}:deliveries`: delivery counts by event id

use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{parse_envelope, BusError, BusRoutes, Delivery, EventBus, EventEnvelope};

/// Default timeout for a publish round-trip.
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Redis-backed event bus.
pub struct RedisEventBus {
    redis: ConnectionManager,
    routes: BusRoutes,
    max_deliveries: u32,
    publish_timeout: Duration,
}

impl RedisEventBus {
    /// Connects to Redis and creates a bus with the given routing table.
    ///
    /// # Errors
    ///
    /// Returns `BusError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, routes: BusRoutes) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, routes))
    }

    /// Creates a bus from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, routes: BusRoutes) -> Self {
        Self {
            redis,
            routes,
            max_deliveries: super::DEFAULT_MAX_DELIVERIES,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Sets the delivery cap before messages are dead-lettered.
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }

    /// Sets the publish timeout.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    fn ready_key(topic: &str, group: &str) -> String {
        format!("prefforge:{}:{}", topic, group)
    }

    fn processing_key(topic: &str, group: &str) -> String {
        format!("prefforge:{}:{}:processing", topic, group)
    }

    fn dead_key(topic: &str, group: &str) -> String {
        format!("prefforge:{}:{}:dead", topic, group)
    }

    fn deliveries_key(topic: &str, group: &str) -> String {
        format!("prefforge:{}:{}:deliveries", topic, group)
    }

    /// Moves a raw message from the processing list to the dead-letter list.
    async fn park(
        &self,
        topic: &str,
        group: &str,
        raw: &str,
        reason: &str,
    ) -> Result<(), BusError> {
        let mut conn = self.redis.clone();

        let entry = serde_json::json!({
            "message": raw,
            "reason": reason,
            "moved_at": chrono::Utc::now().to_rfc3339(),
        });
        let serialized = serde_json::to_string(&entry)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(Self::processing_key(topic, group), 1, raw)
            .lpush(Self::dead_key(topic, group), serialized);
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| BusError::OperationFailed(e.to_string()))?;

        crate::metrics::record_dead_letter();
        Ok(())
    }

    /// Number of ready messages for a `(topic, group)` pair.
    pub async fn len(&self, topic: &str, group: &str) -> Result<usize, BusError> {
        let mut conn = self.redis.clone();
        conn.llen(Self::ready_key(topic, group))
            .await
            .map_err(|e| BusError::OperationFailed(e.to_string()))
    }

    /// Number of dead-lettered messages for a `(topic, group)` pair.
    pub async fn dead_letter_len(&self, topic: &str, group: &str) -> Result<usize, BusError> {
        let mut conn = self.redis.clone();
        conn.llen(Self::dead_key(topic, group))
            .await
            .map_err(|e| BusError::OperationFailed(e.to_string()))
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), BusError> {
        let topic = envelope.topic();
        let groups = self
            .routes
            .groups_for(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;

        let serialized = serde_json::to_string(envelope)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        for group in groups {
            pipe.lpush(Self::ready_key(topic, group), &serialized);
        }

        let publish = pipe.query_async::<()>(&mut conn);
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BusError::OperationFailed(e.to_string())),
            Err(_) => Err(BusError::PublishTimeout(self.publish_timeout)),
        }
    }

    async fn receive(
        &self,
        topic: &str,
        group: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BusError> {
        let ready = Self::ready_key(topic, group);
        let processing = Self::processing_key(topic, group);
        let deliveries = Self::deliveries_key(topic, group);
        let deadline = Instant::now() + timeout;

        let mut conn = self.redis.clone();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let block_secs = remaining.as_secs().max(1) as usize;

            let raw: Option<String> = redis::cmd("BRPOPLPUSH")
                .arg(&ready)
                .arg(&processing)
                .arg(block_secs)
                .query_async(&mut conn)
                .await
                .map_err(|e| BusError::OperationFailed(e.to_string()))?;

            let raw = match raw {
                Some(raw) => raw,
                None => return Ok(None),
            };

            let envelope = match parse_envelope(&raw) {
                Ok(envelope) => envelope,
                Err(reason) => {
                    tracing::error!(topic, group, %reason, "Malformed event, dead-lettering");
                    self.park(topic, group, &raw, &reason).await?;
                    continue;
                }
            };

            let attempt: u32 = conn
                .hincr(&deliveries, envelope.event_id.to_string(), 1)
                .await
                .map_err(|e| BusError::OperationFailed(e.to_string()))?;

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
                self.park(topic, group, &raw, "max deliveries exceeded")
                    .await?;
                let _: () = conn
                    .hdel(&deliveries, envelope.event_id.to_string())
                    .await
                    .map_err(|e| BusError::OperationFailed(e.to_string()))?;
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
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let mut conn = self.redis.clone();
        let processing = Self::processing_key(&delivery.topic, &delivery.group);
        let deliveries = Self::deliveries_key(&delivery.topic, &delivery.group);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&processing, 1, &delivery.raw)
            .hdel(&deliveries, delivery.envelope.event_id.to_string());
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| BusError::OperationFailed(e.to_string()))?;

        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BusError> {
        self.park(&delivery.topic, &delivery.group, &delivery.raw, reason)
            .await
    }

    async fn recover(&self, topic: &str, group: &str) -> Result<usize, BusError> {
        let mut conn = self.redis.clone();
        let ready = Self::ready_key(topic, group);
        let processing = Self::processing_key(topic, group);

        let leased: Vec<String> = conn
            .lrange(&processing, 0, -1)
            .await
            .map_err(|e| BusError::OperationFailed(e.to_string()))?;

        let mut recovered = 0;
        for raw in leased {
            let mut pipe = redis::pipe();
            pipe.atomic().lrem(&processing, 1, &raw).rpush(&ready, &raw);
            pipe.query_async::<()>(&mut conn)
                .await
                .map_err(|e| BusError::OperationFailed(e.to_string()))?;
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!(topic, group, recovered, "Recovered leased messages");
        }

        Ok(recovered)
    }
}
