//! Redis key layout for queues.
//!
//! Every key the broker touches is derived here so the layout lives in one
//! place. For a queue named `orders` the key set is:
//!
//! ```text
//! redmq:orders:pending            list of serialized records (right end = oldest)
//! redmq:orders:inflight:<id>      per-consumer list of records being processed
//! redmq:orders:dlq                dead-letter list
//! redmq:orders:consumers          set of consumer ids known to the queue
//! redmq:orders:alive:<id>         volatile liveness token, one per consumer
//! redmq:orders:gc:lock            volatile GC leadership lease
//! redmq:orders:stats              queue-level counters (advisory)
//! redmq:orders:stats:<id>         per-consumer counters (advisory)
//! redmq:queues                    registry set of all queue names ever seen
//! ```
//!
//! Producers `LPUSH` onto the left of the pending list and consumers move
//! records off the right, so the right end is the head of the FIFO. Re-queued
//! retries are `LPUSH`ed like fresh publishes and therefore never preempt
//! newer messages.

use crate::constants::KEY_NAMESPACE;

/// Key builder for one queue.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    queue: String,
}

impl QueueKeys {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// FIFO list of records awaiting dispatch.
    pub fn pending(&self) -> String {
        format!("{}:{}:pending", KEY_NAMESPACE, self.queue)
    }

    /// List of records currently owned by `consumer_id`.
    pub fn inflight(&self, consumer_id: &str) -> String {
        format!("{}:{}:inflight:{}", KEY_NAMESPACE, self.queue, consumer_id)
    }

    /// Terminal list for records whose retries were exhausted.
    pub fn dlq(&self) -> String {
        format!("{}:{}:dlq", KEY_NAMESPACE, self.queue)
    }

    /// Set of consumer ids ever registered on this queue.
    pub fn consumers(&self) -> String {
        format!("{}:{}:consumers", KEY_NAMESPACE, self.queue)
    }

    /// Volatile liveness token for `consumer_id`.
    pub fn alive(&self, consumer_id: &str) -> String {
        format!("{}:{}:alive:{}", KEY_NAMESPACE, self.queue, consumer_id)
    }

    /// Volatile lease naming the current GC leader.
    pub fn gc_lock(&self) -> String {
        format!("{}:{}:gc:lock", KEY_NAMESPACE, self.queue)
    }

    /// Queue-level stats hash.
    pub fn stats(&self) -> String {
        format!("{}:{}:stats", KEY_NAMESPACE, self.queue)
    }

    /// Per-consumer stats hash.
    pub fn consumer_stats(&self, consumer_id: &str) -> String {
        format!("{}:{}:stats:{}", KEY_NAMESPACE, self.queue, consumer_id)
    }

    /// Registry set holding every queue name ever seen.
    pub fn registry() -> &'static str {
        "redmq:queues"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("orders");
        assert_eq!(keys.queue_name(), "orders");
        assert_eq!(keys.pending(), "redmq:orders:pending");
        assert_eq!(keys.inflight("c1"), "redmq:orders:inflight:c1");
        assert_eq!(keys.dlq(), "redmq:orders:dlq");
        assert_eq!(keys.consumers(), "redmq:orders:consumers");
        assert_eq!(keys.alive("c1"), "redmq:orders:alive:c1");
        assert_eq!(keys.gc_lock(), "redmq:orders:gc:lock");
        assert_eq!(keys.stats(), "redmq:orders:stats");
        assert_eq!(keys.consumer_stats("c1"), "redmq:orders:stats:c1");
        assert_eq!(QueueKeys::registry(), "redmq:queues");
    }

    #[test]
    fn test_keys_are_disjoint_across_queues() {
        let a = QueueKeys::new("a");
        let b = QueueKeys::new("b");
        assert_ne!(a.pending(), b.pending());
        assert_ne!(a.dlq(), b.dlq());
        assert_ne!(a.gc_lock(), b.gc_lock());
    }
}
