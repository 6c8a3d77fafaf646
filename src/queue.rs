//! Queue registry and inspection helpers.
//!
//! Read-only views over a queue's key set plus a purge facility for tests
//! and operational cleanup. The monitor consumes the same keys directly;
//! nothing here participates in the delivery path.

use std::collections::HashMap;

use deadpool_redis::{Pool, redis::AsyncCommands};
use tracing::warn;

use crate::errors::QueueError;
use crate::keyspace::QueueKeys;

fn operation_failed(operation: &str) -> impl FnOnce(deadpool_redis::redis::RedisError) -> QueueError {
    let operation = operation.to_string();
    move |source| QueueError::RedisOperationFailed { operation, source }
}

async fn connection(pool: &Pool) -> Result<deadpool_redis::Connection, QueueError> {
    pool.get().await.map_err(|e| QueueError::ConnectionFailed {
        details: e.to_string(),
    })
}

/// Every queue name ever seen by a producer or consumer.
pub async fn queue_names(pool: &Pool) -> Result<Vec<String>, QueueError> {
    let mut conn = connection(pool).await?;
    let mut names: Vec<String> = conn
        .smembers(QueueKeys::registry())
        .await
        .map_err(operation_failed("smembers (registry)"))?;
    names.sort();
    Ok(names)
}

/// Point-in-time list depths of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDepths {
    pub pending: usize,
    pub dead_lettered: usize,
    /// In-flight depth per registered consumer id.
    pub inflight: HashMap<String, usize>,
}

impl QueueDepths {
    /// Records currently held somewhere in the queue.
    pub fn total(&self) -> usize {
        self.pending + self.dead_lettered + self.inflight.values().sum::<usize>()
    }
}

pub async fn queue_depths(pool: &Pool, queue_name: &str) -> Result<QueueDepths, QueueError> {
    let keys = QueueKeys::new(queue_name);
    let mut conn = connection(pool).await?;

    let pending: usize = conn
        .llen(keys.pending())
        .await
        .map_err(operation_failed("llen (pending)"))?;
    let dead_lettered: usize = conn
        .llen(keys.dlq())
        .await
        .map_err(operation_failed("llen (dlq)"))?;

    let consumer_ids: Vec<String> = conn
        .smembers(keys.consumers())
        .await
        .map_err(operation_failed("smembers (consumers)"))?;
    let mut inflight = HashMap::new();
    for cid in consumer_ids {
        let depth: usize = conn
            .llen(keys.inflight(&cid))
            .await
            .map_err(operation_failed("llen (inflight)"))?;
        inflight.insert(cid, depth);
    }

    Ok(QueueDepths {
        pending,
        dead_lettered,
        inflight,
    })
}

/// Delete every key of a queue and remove it from the registry.
///
/// Destroys pending, in-flight, and dead-lettered records alike; meant for
/// tests and deliberate operational cleanup, not the delivery path.
pub async fn purge(pool: &Pool, queue_name: &str) -> Result<(), QueueError> {
    let keys = QueueKeys::new(queue_name);
    let mut conn = connection(pool).await?;

    let consumer_ids: Vec<String> = conn
        .smembers(keys.consumers())
        .await
        .map_err(operation_failed("smembers (consumers)"))?;

    let mut doomed = vec![keys.pending(), keys.dlq(), keys.consumers(), keys.gc_lock(), keys.stats()];
    for cid in &consumer_ids {
        doomed.push(keys.inflight(cid));
        doomed.push(keys.alive(cid));
        doomed.push(keys.consumer_stats(cid));
    }

    let _: i64 = conn
        .del(&doomed)
        .await
        .map_err(operation_failed("del (purge)"))?;
    let removed: i64 = conn
        .srem(QueueKeys::registry(), queue_name)
        .await
        .map_err(operation_failed("srem (registry)"))?;
    if removed == 0 {
        warn!(queue = %queue_name, "Purged queue was not in the registry");
    }
    Ok(())
}
