//! Statistics publication for the external monitor.
//!
//! Consumers keep counters in shared atomics and a periodic task writes them,
//! together with heartbeat metadata, into a per-consumer Redis hash with a
//! short expiry so the monitor's roster self-cleans. Producers bump a
//! queue-level publish counter. The whole path is advisory: every error here
//! is logged and swallowed, and queue correctness never depends on it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use deadpool_redis::{Pool, redis::AsyncCommands};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::keyspace::QueueKeys;
use crate::message::now_ms;

/// Upper bounds (ms) of the processing-duration histogram buckets; a fifth
/// bucket catches everything slower.
const PROCESSING_BUCKET_BOUNDS_MS: [u64; 4] = [10, 100, 1_000, 10_000];

const PROCESSING_BUCKET_FIELDS: [&str; 5] = [
    "processing_ms_le_10",
    "processing_ms_le_100",
    "processing_ms_le_1000",
    "processing_ms_le_10000",
    "processing_ms_gt_10000",
];

/// Delivery counters shared between the pull loop and the stats emitter.
#[derive(Debug, Default)]
pub struct ConsumerCounters {
    /// Messages acknowledged and deleted.
    pub acks: AtomicU64,
    /// Handler failures and watchdog timeouts (before retry policy).
    pub failed: AtomicU64,
    /// Failed messages returned to the pending list.
    pub requeued: AtomicU64,
    /// Messages moved to the dead-letter list.
    pub dead_lettered: AtomicU64,
    /// Messages discarded because their TTL elapsed.
    pub expired: AtomicU64,
    processing_buckets: [AtomicU64; 5],
}

impl ConsumerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one handler invocation's wall-clock duration.
    pub fn record_processing_ms(&self, ms: u64) {
        let index = PROCESSING_BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(PROCESSING_BUCKET_BOUNDS_MS.len());
        self.processing_buckets[index].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            acks: self.acks.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            processing_buckets: std::array::from_fn(|i| {
                self.processing_buckets[i].load(Ordering::Relaxed)
            }),
        }
    }
}

/// Point-in-time copy of a consumer's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub acks: u64,
    pub failed: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub expired: u64,
    pub processing_buckets: [u64; 5],
}

/// Periodic task publishing one consumer's counters to Redis.
pub(crate) struct StatsEmitter {
    pool: Pool,
    keys: QueueKeys,
    consumer_id: String,
    counters: Arc<ConsumerCounters>,
    interval: Duration,
    cancel: CancellationToken,
}

impl StatsEmitter {
    pub(crate) fn new(
        pool: Pool,
        keys: QueueKeys,
        consumer_id: String,
        counters: Arc<ConsumerCounters>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            keys,
            consumer_id,
            counters,
            interval,
            cancel,
        }
    }

    pub(crate) async fn run(self) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Final flush so a clean shutdown leaves current numbers.
                    if let Err(e) = self.publish().await {
                        debug!(error = %e, "Final stats flush failed");
                    }
                    return;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.publish().await {
                        warn!(
                            consumer_id = %self.consumer_id,
                            queue = %self.keys.queue_name(),
                            error = %e,
                            "Stats publication failed"
                        );
                    }
                }
            }
        }
    }

    async fn publish(&self) -> anyhow::Result<()> {
        let snapshot = self.counters.snapshot();
        let mut fields: Vec<(String, String)> = vec![
            ("consumer_id".to_string(), self.consumer_id.clone()),
            (
                "queue".to_string(),
                self.keys.queue_name().to_string(),
            ),
            ("last_seen".to_string(), now_ms().to_string()),
            ("acks".to_string(), snapshot.acks.to_string()),
            ("failed".to_string(), snapshot.failed.to_string()),
            ("requeued".to_string(), snapshot.requeued.to_string()),
            (
                "dead_lettered".to_string(),
                snapshot.dead_lettered.to_string(),
            ),
            ("expired".to_string(), snapshot.expired.to_string()),
        ];
        for (field, count) in PROCESSING_BUCKET_FIELDS
            .iter()
            .zip(snapshot.processing_buckets)
        {
            fields.push((field.to_string(), count.to_string()));
        }

        let key = self.keys.consumer_stats(&self.consumer_id);
        let ttl_ms = (self.interval.as_millis() as i64) * 3;
        let mut conn = self.pool.get().await?;
        let _: () = conn.hset_multiple(&key, &fields).await?;
        let _: () = conn.pexpire(&key, ttl_ms).await?;
        Ok(())
    }
}

/// Bump the queue-level publish counter. Advisory; errors are logged only.
pub(crate) async fn bump_queue_input(pool: &Pool, keys: &QueueKeys) {
    let result: anyhow::Result<()> = async {
        let mut conn = pool.get().await?;
        let _: i64 = conn.hincr(keys.stats(), "input", 1).await?;
        Ok(())
    }
    .await;
    if let Err(e) = result {
        debug!(queue = %keys.queue_name(), error = %e, "Input counter bump failed");
    }
}
