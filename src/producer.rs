//! Message producer.
//!
//! A producer is stateless beyond its connection pool: it builds a record,
//! serializes it, and appends it to the queue's pending list in one atomic
//! pipeline that also keeps the queue registry current. Multiple producers
//! may target the same queue concurrently.

use deadpool_redis::{Pool, redis};
use serde_json::Value;
use tracing::{debug, trace};

use crate::errors::{ProducerError, QueueError};
use crate::keyspace::QueueKeys;
use crate::message::Message;
use crate::stats;

pub struct Producer {
    pool: Pool,
    keys: QueueKeys,
    /// TTL stamped onto records whose publish call does not set one;
    /// 0 means none.
    default_ttl_ms: u64,
}

impl Producer {
    pub fn new(pool: Pool, queue_name: impl Into<String>) -> Self {
        let keys = QueueKeys::new(queue_name);
        debug!(queue = %keys.queue_name(), "Initializing producer");
        Self {
            pool,
            keys,
            default_ttl_ms: 0,
        }
    }

    /// Stamp every record published through [`Producer::produce`] with this
    /// TTL. Records published with an explicit TTL are unaffected.
    pub fn with_default_ttl(mut self, ttl_ms: u64) -> Self {
        self.default_ttl_ms = ttl_ms;
        self
    }

    pub fn queue_name(&self) -> &str {
        self.keys.queue_name()
    }

    /// Publish a payload. Returns the generated record uuid.
    pub async fn produce(&self, payload: Value) -> Result<String, ProducerError> {
        let record = if self.default_ttl_ms > 0 {
            Message::with_ttl(payload, self.default_ttl_ms)
        } else {
            Message::new(payload)
        };
        self.publish(record).await
    }

    /// Publish a payload with a per-message TTL in milliseconds.
    /// Rejects `ttl_ms == 0` before any Redis command.
    pub async fn produce_with_ttl(
        &self,
        payload: Value,
        ttl_ms: u64,
    ) -> Result<String, ProducerError> {
        if ttl_ms == 0 {
            return Err(ProducerError::ZeroTtl);
        }
        self.publish(Message::with_ttl(payload, ttl_ms)).await
    }

    async fn publish(&self, record: Message) -> Result<String, ProducerError> {
        let raw = record.to_json()?;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                details: e.to_string(),
            })?;

        // Registry membership and the push land together; the registry is
        // how the monitor enumerates queues that have ever existed.
        redis::pipe()
            .atomic()
            .sadd(QueueKeys::registry(), self.keys.queue_name())
            .ignore()
            .lpush(self.keys.pending(), &raw)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::RedisOperationFailed {
                operation: "publish (sadd+lpush)".to_string(),
                source: e,
            })?;

        stats::bump_queue_input(&self.pool, &self.keys).await;

        trace!(
            queue = %self.keys.queue_name(),
            uuid = %record.uuid,
            ttl = record.ttl,
            "Published record"
        );
        Ok(record.uuid)
    }
}
