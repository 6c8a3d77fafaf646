//! Consumer runtime: registration, heartbeat, pull loop, retry policy,
//! zombie detection, and graceful shutdown.
//!
//! A consumer is a single logical worker bound to one queue. The pull loop
//! moves one record at a time from the pending list into the consumer's own
//! in-flight list with an atomic blocking move, runs the user handler under
//! the watchdog, and settles the record: acknowledged records are deleted,
//! failures are re-queued with a bumped attempt counter until the retry
//! threshold sends them to the dead-letter list. A pulled record stays owed
//! to the in-flight list until its settlement lands — transient transport
//! failures retry the settlement of that same record, never pull past it.
//! Heartbeat, GC, and stats run as independent periodic tasks; their only
//! shared state with the pull loop is the counters and Redis itself. They
//! outlive a shutdown request until the pull loop has drained, so a handler
//! finishing inside the shutdown grace keeps a live heartbeat.
//!
//! Two connections are used deliberately: the blocking pull monopolizes a
//! dedicated connection, while heartbeat, acks, GC, and stats go through the
//! pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::{
    Pool,
    redis::{
        self, AsyncCommands, Direction, ExistenceCheck, SetExpiry, SetOptions,
        aio::MultiplexedConnection,
    },
};
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BrokerConfig, ConsumerOptions};
use crate::constants::{BACKOFF_BASE_MS, BACKOFF_CAP_MS};
use crate::errors::{ConsumerError, QueueError};
use crate::gc::GarbageCollector;
use crate::keyspace::QueueKeys;
use crate::message::{Message, now_ms};
use crate::scripts::MOVE_RECORD;
use crate::stats::{ConsumerCounters, StatsEmitter};
use crate::watchdog::{self, HandlerVerdict};

/// User-supplied message handling capability.
///
/// `Ok(())` acknowledges the message; any error triggers the retry policy.
/// Handlers see only the payload, never the broker's bookkeeping: a retried
/// message arrives as another `handle` call with the same payload.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> anyhow::Result<()>;
}

/// Lifecycle states of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Initializing = 0,
    Running = 1,
    Processing = 2,
    ShuttingDown = 3,
    Stopped = 4,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initializing,
            1 => Self::Running,
            2 => Self::Processing,
            3 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Processing => "processing",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

/// Capped exponential backoff after consecutive transport failures.
fn backoff_delay(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << exponent);
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

/// Redis-side outcome owed to a pulled record once the handler phase is
/// over. Computed without touching Redis so that applying it can be retried
/// on transport failures without re-running the handler.
enum Settlement {
    /// Remove from the in-flight list; the handler acknowledged.
    Ack,
    /// Remove from the in-flight list; the record's TTL elapsed before
    /// dispatch.
    Expired,
    /// Move the raw blob to the DLQ unchanged; it could not be parsed.
    DeadLetterRaw,
    /// Apply the retry policy to a failed record (attempts already bumped).
    Failed(Message),
}

pub struct Consumer {
    id: String,
    keys: QueueKeys,
    config: BrokerConfig,
    options: ConsumerOptions,
    handler: Arc<dyn MessageHandler>,
    pool: Pool,
    counters: Arc<ConsumerCounters>,
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
}

impl Consumer {
    /// Build a consumer for `queue_name`. Configuration problems are fatal
    /// here, before any message is touched.
    pub fn new(
        config: BrokerConfig,
        options: ConsumerOptions,
        queue_name: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, ConsumerError> {
        config.validate()?;
        options.validate()?;
        let pool = config.create_pool().map_err(ConsumerError::Registration)?;

        let id = Uuid::new_v4().to_string();
        let keys = QueueKeys::new(queue_name);
        info!(
            consumer_id = %id,
            queue = %keys.queue_name(),
            consume_timeout_ms = options.message_consume_timeout,
            message_ttl_ms = options.message_ttl,
            retry_threshold = options.message_retry_threshold,
            "Consumer configured"
        );

        Ok(Self {
            id,
            keys,
            config,
            options,
            handler,
            pool,
            counters: Arc::new(ConsumerCounters::new()),
            cancel: CancellationToken::new(),
            state: Arc::new(AtomicU8::new(ConsumerState::Initializing as u8)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue_name(&self) -> &str {
        self.keys.queue_name()
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Shared delivery counters, also published by the stats task.
    pub fn counters(&self) -> Arc<ConsumerCounters> {
        self.counters.clone()
    }

    /// Token that triggers graceful shutdown when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request graceful shutdown; `run` returns once the in-progress handler
    /// has finished or the shutdown grace elapsed.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Run the consumer until shutdown or a fatal error.
    ///
    /// Returns `Ok(())` on clean shutdown. Errors mean the process should
    /// exit nonzero for a supervisor restart: the consumer detected it was a
    /// zombie, or Redis stayed unreachable past the failure budget.
    pub async fn run(&self) -> Result<(), ConsumerError> {
        info!(consumer_id = %self.id, queue = %self.keys.queue_name(), "Starting consumer");
        self.register().await?;

        let mut pull_conn = self.connect_pull().await?;

        // The shutdown token only stops the pull loop. Background tasks run
        // until the in-progress record is drained, so the liveness token
        // stays fresh for a handler finishing inside the shutdown grace.
        let background = CancellationToken::new();

        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            self.pool.clone(),
            self.keys.clone(),
            self.id.clone(),
            self.config.heartbeat_interval,
            self.config.alive_ttl(),
            self.cancel.clone(),
            background.clone(),
        ));

        let gc = GarbageCollector::new(
            self.pool.clone(),
            self.keys.clone(),
            self.id.clone(),
            self.options.message_retry_threshold,
            self.options.message_ttl,
            self.config.gc_interval,
            self.config.gc_lease_ttl(),
            self.counters.clone(),
            background.clone(),
        );
        let gc_task = tokio::spawn(gc.run());

        let stats = StatsEmitter::new(
            self.pool.clone(),
            self.keys.clone(),
            self.id.clone(),
            self.counters.clone(),
            self.config.stats_interval,
            background.clone(),
        );
        let stats_task = tokio::spawn(stats.run());

        self.set_state(ConsumerState::Running);
        let loop_result = self.pull_loop(&mut pull_conn).await;

        self.set_state(ConsumerState::ShuttingDown);
        self.cancel.cancel();
        background.cancel();

        let heartbeat_result = heartbeat.await;
        let _ = gc_task.await;
        let _ = stats_task.await;
        self.deregister().await;
        self.set_state(ConsumerState::Stopped);

        match heartbeat_result {
            Ok(Err(zombie)) => {
                warn!(consumer_id = %self.id, "Consumer exiting as zombie");
                return Err(zombie);
            }
            Ok(Ok(())) => {}
            Err(e) => warn!(consumer_id = %self.id, error = %e, "Heartbeat task panicked"),
        }
        loop_result?;
        info!(consumer_id = %self.id, queue = %self.keys.queue_name(), "Consumer stopped");
        Ok(())
    }

    /// Announce this consumer: registry membership, consumer-set membership,
    /// and the initial liveness token, in one transaction.
    async fn register(&self) -> Result<(), ConsumerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| {
                ConsumerError::Registration(QueueError::ConnectionFailed {
                    details: e.to_string(),
                })
            })?;

        redis::pipe()
            .atomic()
            .sadd(QueueKeys::registry(), self.keys.queue_name())
            .ignore()
            .sadd(self.keys.consumers(), &self.id)
            .ignore()
            .cmd("SET")
            .arg(self.keys.alive(&self.id))
            .arg(&self.id)
            .arg("PX")
            .arg(self.config.alive_ttl().as_millis() as u64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| {
                ConsumerError::Registration(QueueError::RedisOperationFailed {
                    operation: "register consumer".to_string(),
                    source: e,
                })
            })?;

        debug!(consumer_id = %self.id, queue = %self.keys.queue_name(), "Consumer registered");
        Ok(())
    }

    /// Best-effort removal of the liveness token. The consumer-set entry is
    /// left for the GC, which unregisters it after confirming the in-flight
    /// list is empty.
    async fn deregister(&self) {
        let result: anyhow::Result<()> = async {
            let mut conn = self.pool.get().await?;
            let _: i64 = conn.del(self.keys.alive(&self.id)).await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(
                consumer_id = %self.id,
                error = %e,
                "Failed to delete liveness token; it will expire on its own"
            );
        }
    }

    /// Dedicated connection for the blocking pull.
    async fn connect_pull(&self) -> Result<MultiplexedConnection, ConsumerError> {
        let client = redis::Client::open(self.config.redis_url.as_str()).map_err(|e| {
            ConsumerError::Registration(QueueError::ConnectionFailed {
                details: e.to_string(),
            })
        })?;
        client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                ConsumerError::Registration(QueueError::ConnectionFailed {
                    details: e.to_string(),
                })
            })
    }

    /// Refresh the liveness token every interval. `XX` means the refresh
    /// only succeeds while the token still exists; a `nil` reply proves the
    /// token expired and this consumer is a zombie. The GC may already be
    /// re-queueing its in-flight records, so the only safe move is to stop
    /// processing and exit. A zombie never re-creates its own token.
    ///
    /// The loop runs until `stop` fires — which `run` delays until the pull
    /// loop has drained — not when shutdown is merely requested; a shutdown
    /// that waits on a slow handler must not let the token lapse and invite
    /// the GC to reclaim a record that is still being processed. Zombie
    /// detection cancels `shutdown` to bring the rest of the consumer down.
    async fn heartbeat_loop(
        pool: Pool,
        keys: QueueKeys,
        consumer_id: String,
        interval: Duration,
        alive_ttl: Duration,
        shutdown: CancellationToken,
        stop: CancellationToken,
    ) -> Result<(), ConsumerError> {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The registration SET already covers the first interval.
        tick.tick().await;

        let alive_key = keys.alive(&consumer_id);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    let refresh: Result<Option<String>, _> = async {
                        let mut conn = pool.get().await?;
                        let previous: Option<String> = conn
                            .set_options(
                                &alive_key,
                                &consumer_id,
                                SetOptions::default()
                                    .conditional_set(ExistenceCheck::XX)
                                    .get(true)
                                    .with_expiration(SetExpiry::PX(alive_ttl.as_millis() as u64)),
                            )
                            .await?;
                        anyhow::Ok(previous)
                    }
                    .await;

                    match refresh {
                        Ok(Some(_)) => {
                            debug!(consumer_id = %consumer_id, "Heartbeat refreshed liveness token");
                        }
                        Ok(None) => {
                            warn!(
                                consumer_id = %consumer_id,
                                queue = %keys.queue_name(),
                                "Liveness token expired before refresh; consumer is a zombie"
                            );
                            shutdown.cancel();
                            return Err(ConsumerError::ZombieDetected { consumer_id });
                        }
                        Err(e) => {
                            // Missed heartbeats shorten the token's remaining
                            // life; if it lapses, the XX refresh will report
                            // the zombie on a later tick.
                            warn!(consumer_id = %consumer_id, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        }
    }

    async fn pull_loop(&self, pull_conn: &mut MultiplexedConnection) -> Result<(), ConsumerError> {
        let pending = self.keys.pending();
        let inflight = self.keys.inflight(&self.id);
        let pull_timeout_secs = self.config.pull_timeout.as_secs_f64();
        let mut consecutive_failures: u32 = 0;

        while !self.cancel.is_cancelled() {
            let pulled: Result<Option<String>, _> = pull_conn
                .blmove(
                    &pending,
                    &inflight,
                    Direction::Right,
                    Direction::Left,
                    pull_timeout_secs,
                )
                .await;

            let raw = match pulled {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    let delay =
                        self.register_transport_failure(&mut consecutive_failures, e.to_string())?;
                    warn!(
                        consumer_id = %self.id,
                        consecutive_failures,
                        error = %e,
                        "Blocking pull failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let settlement = tokio::select! {
                settlement = self.dispatch(&raw) => settlement,
                _ = async {
                    self.cancel.cancelled().await;
                    tokio::time::sleep(self.config.shutdown_grace).await;
                } => {
                    warn!(
                        consumer_id = %self.id,
                        "Shutdown grace elapsed mid-handler; leaving record for GC reclamation"
                    );
                    break;
                }
            };

            // The record is owed to our in-flight list until this lands;
            // never pull another record past an unsettled one.
            loop {
                match self.settle(&raw, &settlement).await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        break;
                    }
                    Err(e) if self.cancel.is_cancelled() => {
                        warn!(
                            consumer_id = %self.id,
                            error = %e,
                            "Settlement failed during shutdown; leaving record for GC reclamation"
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        let delay = self.register_transport_failure(
                            &mut consecutive_failures,
                            e.to_string(),
                        )?;
                        warn!(
                            consumer_id = %self.id,
                            consecutive_failures,
                            error = %e,
                            "Record settlement failed; retrying the same record"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Ok(())
    }

    fn register_transport_failure(
        &self,
        consecutive_failures: &mut u32,
        details: String,
    ) -> Result<Duration, ConsumerError> {
        *consecutive_failures += 1;
        if *consecutive_failures >= self.config.transport_failure_budget {
            return Err(ConsumerError::TransportBudgetExceeded {
                consecutive_failures: *consecutive_failures,
                details,
            });
        }
        Ok(backoff_delay(*consecutive_failures))
    }

    /// Take one pulled record through deserialize → TTL check → handler and
    /// decide its settlement. Touches no Redis, so the handler runs exactly
    /// once per pull no matter how often the settlement must be retried.
    async fn dispatch(&self, raw: &str) -> Settlement {
        let record = match Message::from_json(raw) {
            Ok(record) => record,
            Err(e) => {
                // Unparseable records go straight to the DLQ, never retried.
                warn!(
                    consumer_id = %self.id,
                    queue = %self.keys.queue_name(),
                    error = %e,
                    "Unparseable record; dead-lettering"
                );
                return Settlement::DeadLetterRaw;
            }
        };

        if record.is_expired_at(now_ms(), self.options.message_ttl) {
            debug!(uuid = %record.uuid, "Discarding expired record at dispatch");
            return Settlement::Expired;
        }

        let budget = (self.options.message_consume_timeout > 0)
            .then(|| Duration::from_millis(self.options.message_consume_timeout));

        self.set_state(ConsumerState::Processing);
        let started = Instant::now();
        let verdict = watchdog::supervise(self.handler.clone(), record.data.clone(), budget).await;
        self.counters
            .record_processing_ms(started.elapsed().as_millis() as u64);
        self.set_state(ConsumerState::Running);

        match verdict {
            HandlerVerdict::Ack => Settlement::Ack,
            HandlerVerdict::Fail(reason) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                debug!(uuid = %record.uuid, reason = %reason, "Handler failed");
                let mut record = record;
                record.increment_attempts();
                Settlement::Failed(record)
            }
            HandlerVerdict::TimedOut => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    consumer_id = %self.id,
                    uuid = %record.uuid,
                    budget_ms = self.options.message_consume_timeout,
                    "Processing timeout elapsed"
                );
                let mut record = record;
                record.increment_attempts();
                Settlement::Failed(record)
            }
        }
    }

    /// Apply a settlement to the record still sitting in the in-flight
    /// list. Each move is one atomic script or single command, and the whole
    /// step is safe to retry: a record already settled by a racing GC leader
    /// yields a no-op.
    async fn settle(&self, raw: &str, settlement: &Settlement) -> anyhow::Result<()> {
        let inflight = self.keys.inflight(&self.id);
        let mut conn = self.pool.get().await?;

        match settlement {
            Settlement::Ack => {
                let removed: i64 = conn.lrem(&inflight, 1, raw).await?;
                if removed == 0 {
                    // The record was reclaimed while we processed it; the
                    // retry policy elsewhere now owns it.
                    warn!(
                        consumer_id = %self.id,
                        "Record missing from in-flight list at ack"
                    );
                } else {
                    self.counters.acks.fetch_add(1, Ordering::Relaxed);
                    debug!(consumer_id = %self.id, "Acknowledged record");
                }
            }
            Settlement::Expired => {
                let removed: i64 = conn.lrem(&inflight, 1, raw).await?;
                if removed > 0 {
                    self.counters.expired.fetch_add(1, Ordering::Relaxed);
                }
            }
            Settlement::DeadLetterRaw => {
                let moved: i32 = MOVE_RECORD
                    .key(&inflight)
                    .key(self.keys.dlq())
                    .arg(raw)
                    .arg(raw)
                    .invoke_async(&mut conn)
                    .await?;
                if moved == 1 {
                    self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                }
            }
            Settlement::Failed(record) => {
                // The TTL may have elapsed during processing; such records
                // are deleted, not re-queued.
                if record.is_expired_at(now_ms(), self.options.message_ttl) {
                    let removed: i64 = conn.lrem(&inflight, 1, raw).await?;
                    if removed > 0 {
                        self.counters.expired.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            uuid = %record.uuid,
                            "Discarded record whose TTL elapsed during processing"
                        );
                    }
                    return Ok(());
                }

                let exhausted =
                    record.exceeded_retry_threshold(self.options.message_retry_threshold);
                let destination = if exhausted {
                    self.keys.dlq()
                } else {
                    self.keys.pending()
                };
                let moved: i32 = MOVE_RECORD
                    .key(&inflight)
                    .key(&destination)
                    .arg(raw)
                    .arg(record.to_json()?)
                    .invoke_async(&mut conn)
                    .await?;
                if moved == 0 {
                    warn!(
                        consumer_id = %self.id,
                        uuid = %record.uuid,
                        "Record missing from in-flight list at settlement"
                    );
                } else if exhausted {
                    self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    info!(
                        uuid = %record.uuid,
                        attempts = record.attempts,
                        queue = %self.keys.queue_name(),
                        "Dead-lettered record"
                    );
                } else {
                    self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                    debug!(uuid = %record.uuid, attempts = record.attempts, "Re-queued record");
                }
            }
        }
        Ok(())
    }
}
