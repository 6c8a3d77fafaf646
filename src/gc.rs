//! Garbage collection: dead-consumer reclamation and TTL sweeping.
//!
//! Every consumer runs a GC task, but per queue only one acts at a time: the
//! task competes for a volatile lease on the queue's `gc:lock` key and only
//! the holder does work. The lease expires after two missed ticks, so a
//! crashed leader is replaced without coordination; a clean shutdown releases
//! it immediately via a compare-and-delete.
//!
//! Each tick the leader walks the queue's consumer set. A consumer whose
//! liveness token is gone is presumed dead and its in-flight list is drained
//! oldest-first, applying the normal failure policy to every record: bump
//! `attempts`, then dead-letter, discard as expired, or return to pending.
//! Reclamation uses the same atomic move scripts as the consumers, which
//! makes it idempotent — two leaders racing across a lease boundary converge
//! to the same state. A recovering consumer that was presumed dead notices
//! the loss of its own liveness token at its next heartbeat and exits rather
//! than touch records that may already have been reclaimed.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use deadpool_redis::{
    Pool,
    redis::{AsyncCommands, ExistenceCheck, SetExpiry, SetOptions},
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::keyspace::QueueKeys;
use crate::message::{Message, now_ms};
use crate::scripts::{MOVE_RECORD, RELEASE_LOCK};
use crate::stats::ConsumerCounters;

pub(crate) struct GarbageCollector {
    pool: Pool,
    keys: QueueKeys,
    consumer_id: String,
    retry_threshold: u32,
    default_ttl_ms: u64,
    tick: Duration,
    lease_ttl: Duration,
    counters: Arc<ConsumerCounters>,
    cancel: CancellationToken,
    is_leader: bool,
}

impl GarbageCollector {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pool: Pool,
        keys: QueueKeys,
        consumer_id: String,
        retry_threshold: u32,
        default_ttl_ms: u64,
        tick: Duration,
        lease_ttl: Duration,
        counters: Arc<ConsumerCounters>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            keys,
            consumer_id,
            retry_threshold,
            default_ttl_ms,
            tick,
            lease_ttl,
            counters,
            cancel,
            is_leader: false,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if self.is_leader {
                        self.release_lease().await;
                    }
                    return;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.tick_once().await {
                        warn!(
                            queue = %self.keys.queue_name(),
                            consumer_id = %self.consumer_id,
                            error = %e,
                            "GC tick failed"
                        );
                    }
                }
            }
        }
    }

    async fn tick_once(&mut self) -> anyhow::Result<()> {
        if !self.ensure_leadership().await? {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        self.reclaim_dead_consumers(&mut conn).await?;
        self.sweep_expired_pending(&mut conn).await?;
        Ok(())
    }

    /// Acquire or refresh the GC lease. Returns whether this consumer is
    /// the current leader.
    async fn ensure_leadership(&mut self) -> anyhow::Result<bool> {
        let mut conn = self.pool.get().await?;
        let lock = self.keys.gc_lock();

        // SET NX GET in one step: nil means we took a vacant lease, our own
        // id means we still hold it and only need to push the expiry out.
        let previous: Option<String> = conn
            .set_options(
                &lock,
                &self.consumer_id,
                SetOptions::default()
                    .conditional_set(ExistenceCheck::NX)
                    .get(true)
                    .with_expiration(SetExpiry::PX(self.lease_ttl.as_millis() as u64)),
            )
            .await?;

        let leader = match previous {
            None => {
                if !self.is_leader {
                    info!(
                        queue = %self.keys.queue_name(),
                        consumer_id = %self.consumer_id,
                        "Acquired GC lease"
                    );
                }
                true
            }
            Some(owner) if owner == self.consumer_id => {
                let _: bool = conn
                    .pexpire(&lock, self.lease_ttl.as_millis() as i64)
                    .await?;
                true
            }
            Some(_) => {
                if self.is_leader {
                    info!(
                        queue = %self.keys.queue_name(),
                        consumer_id = %self.consumer_id,
                        "Lost GC lease to another consumer"
                    );
                }
                false
            }
        };
        self.is_leader = leader;
        Ok(leader)
    }

    async fn release_lease(&mut self) {
        let result: anyhow::Result<i32> = async {
            let mut conn = self.pool.get().await?;
            let released = RELEASE_LOCK
                .key(self.keys.gc_lock())
                .arg(&self.consumer_id)
                .invoke_async(&mut conn)
                .await?;
            Ok(released)
        }
        .await;
        match result {
            Ok(1) => debug!(
                queue = %self.keys.queue_name(),
                consumer_id = %self.consumer_id,
                "Released GC lease"
            ),
            Ok(_) => {}
            Err(e) => warn!(
                queue = %self.keys.queue_name(),
                error = %e,
                "Failed to release GC lease; it will expire on its own"
            ),
        }
        self.is_leader = false;
    }

    async fn reclaim_dead_consumers(
        &self,
        conn: &mut deadpool_redis::Connection,
    ) -> anyhow::Result<()> {
        let consumer_ids: Vec<String> = conn.smembers(self.keys.consumers()).await?;
        for cid in consumer_ids {
            // Our own liveness is judged by the heartbeat, not the GC.
            if cid == self.consumer_id {
                continue;
            }
            let alive: bool = conn.exists(self.keys.alive(&cid)).await?;
            if alive {
                continue;
            }

            let drained = self.drain_inflight(conn, &cid).await?;
            let remaining: i64 = conn.llen(self.keys.inflight(&cid)).await?;
            if remaining == 0 {
                let _: i64 = conn.srem(self.keys.consumers(), &cid).await?;
                if drained > 0 {
                    info!(
                        queue = %self.keys.queue_name(),
                        dead_consumer = %cid,
                        reclaimed = drained,
                        "Reclaimed in-flight records of dead consumer"
                    );
                } else {
                    debug!(
                        queue = %self.keys.queue_name(),
                        dead_consumer = %cid,
                        "Unregistered dead consumer with empty in-flight list"
                    );
                }
            }
        }
        Ok(())
    }

    /// Apply the failure policy to every record a dead consumer left behind,
    /// oldest first. Returns how many records were settled.
    async fn drain_inflight(
        &self,
        conn: &mut deadpool_redis::Connection,
        dead_consumer_id: &str,
    ) -> anyhow::Result<usize> {
        let inflight = self.keys.inflight(dead_consumer_id);
        let raws: Vec<String> = conn.lrange(&inflight, 0, -1).await?;
        let mut settled = 0;
        // LPUSH-fed lists read newest-first; reclaim in publish order.
        for raw in raws.into_iter().rev() {
            self.reclaim_record(conn, &inflight, &raw).await?;
            settled += 1;
        }
        Ok(settled)
    }

    async fn reclaim_record(
        &self,
        conn: &mut deadpool_redis::Connection,
        inflight: &str,
        raw: &str,
    ) -> anyhow::Result<()> {
        let mut record = match Message::from_json(raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    queue = %self.keys.queue_name(),
                    error = %e,
                    "Unparseable in-flight record; dead-lettering"
                );
                let moved: i32 = MOVE_RECORD
                    .key(inflight)
                    .key(self.keys.dlq())
                    .arg(raw)
                    .arg(raw)
                    .invoke_async(conn)
                    .await?;
                if moved == 1 {
                    self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(());
            }
        };

        record.increment_attempts();
        if record.is_expired_at(now_ms(), self.default_ttl_ms) {
            let removed: i64 = conn.lrem(inflight, 1, raw).await?;
            if removed > 0 {
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                debug!(uuid = %record.uuid, "Discarded expired record during reclamation");
            }
            return Ok(());
        }

        let destination = if record.exceeded_retry_threshold(self.retry_threshold) {
            self.keys.dlq()
        } else {
            self.keys.pending()
        };
        let moved: i32 = MOVE_RECORD
            .key(inflight)
            .key(&destination)
            .arg(raw)
            .arg(record.to_json()?)
            .invoke_async(conn)
            .await?;
        if moved == 0 {
            // Another leader settled this record across a lease boundary.
            debug!(uuid = %record.uuid, "Record already reclaimed elsewhere");
        } else if record.exceeded_retry_threshold(self.retry_threshold) {
            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            debug!(uuid = %record.uuid, attempts = record.attempts, "Dead-lettered reclaimed record");
        } else {
            self.counters.requeued.fetch_add(1, Ordering::Relaxed);
            debug!(uuid = %record.uuid, attempts = record.attempts, "Re-queued reclaimed record");
        }
        Ok(())
    }

    /// Discard expired records at the head of the pending list. Stops at the
    /// first live record; a head stolen by a concurrent pull is harmless
    /// because the dispatching consumer re-checks TTL.
    async fn sweep_expired_pending(
        &self,
        conn: &mut deadpool_redis::Connection,
    ) -> anyhow::Result<()> {
        let pending = self.keys.pending();
        loop {
            let head: Option<String> = conn.lindex(&pending, -1).await?;
            let Some(raw) = head else {
                return Ok(());
            };
            let record = match Message::from_json(&raw) {
                Ok(record) => record,
                // Poisoned heads are settled by the consumer that pulls them.
                Err(_) => return Ok(()),
            };
            if !record.is_expired_at(now_ms(), self.default_ttl_ms) {
                return Ok(());
            }
            let removed: i64 = conn.lrem(&pending, 1, &raw).await?;
            if removed == 0 {
                return Ok(());
            }
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            debug!(
                queue = %self.keys.queue_name(),
                uuid = %record.uuid,
                "Discarded expired pending record"
            );
        }
    }
}
