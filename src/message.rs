//! Message record envelope.
//!
//! A record wraps an opaque JSON payload with the metadata the broker needs
//! to route it: a unique id, the publish timestamp, an optional TTL, and the
//! delivery attempt counter. The JSON field names are the wire format shared
//! by every producer and consumer of a deployment and must stay stable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::SerializationError;

/// Current Unix time in milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A serializable message record.
///
/// `uuid`, `data`, `time`, and `ttl` are immutable once the record is
/// persisted. Only `attempts` changes, and only under exclusive possession:
/// by the consumer holding the record in its in-flight list, or by the GC
/// leader draining a dead consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id, generated at publish.
    pub uuid: String,
    /// Opaque payload; the broker never inspects it.
    pub data: Value,
    /// Publish time on the producer clock, Unix milliseconds.
    pub time: i64,
    /// Time-to-live in milliseconds; 0 means none.
    pub ttl: u64,
    /// Completed delivery attempts so far.
    pub attempts: u32,
}

impl Message {
    /// Create a record with no TTL.
    pub fn new(data: Value) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            data,
            time: now_ms(),
            ttl: 0,
            attempts: 0,
        }
    }

    /// Create a record with a TTL in milliseconds.
    pub fn with_ttl(data: Value, ttl_ms: u64) -> Self {
        Self {
            ttl: ttl_ms,
            ..Self::new(data)
        }
    }

    pub fn to_json(&self) -> Result<String, SerializationError> {
        serde_json::to_string(self).map_err(|e| SerializationError::RecordEncodeFailed { source: e })
    }

    pub fn from_json(raw: &str) -> Result<Self, SerializationError> {
        serde_json::from_str(raw).map_err(|e| SerializationError::RecordDecodeFailed { source: e })
    }

    /// The TTL that governs this record at dispatch: its own if set,
    /// otherwise the consumer-supplied default. The stored record is never
    /// mutated with the default.
    pub fn effective_ttl(&self, default_ttl_ms: u64) -> u64 {
        if self.ttl > 0 { self.ttl } else { default_ttl_ms }
    }

    /// Whether the record's effective TTL has elapsed at `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64, default_ttl_ms: u64) -> bool {
        let ttl = self.effective_ttl(default_ttl_ms);
        ttl > 0 && now_ms.saturating_sub(self.time) > ttl as i64
    }

    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// `attempts` at or beyond the threshold means no further re-queue.
    pub fn exceeded_retry_threshold(&self, threshold: u32) -> bool {
        self.attempts >= threshold
    }
}
