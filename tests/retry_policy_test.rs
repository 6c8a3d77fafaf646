//! Retry and dead-letter policy tests against a real Redis.

mod helpers;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use deadpool_redis::redis::AsyncCommands;
use redmq::config::ConsumerOptions;
use redmq::consumer::Consumer;
use redmq::keyspace::QueueKeys;
use redmq::message::Message;
use redmq::producer::Producer;
use redmq::queue;
use serde_json::json;

use helpers::{FailTimesHandler, redis_available, test_config, unique_queue, wait_for};

#[tokio::test]
async fn test_failures_below_threshold_are_retried() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available. Set TEST_REDIS_URL to enable.");
        return;
    }

    let queue_name = unique_queue("retry");
    let pool = helpers::create_test_pool();
    let producer = Producer::new(pool.clone(), queue_name.clone());
    producer.produce(json!("X")).await.expect("produce");

    // Fails twice, succeeds on the third call; threshold 3 keeps it alive.
    let handler = FailTimesHandler::new(2);
    let calls = handler.calls();
    let seen = handler.seen();
    let consumer = Consumer::new(
        test_config(),
        ConsumerOptions {
            message_retry_threshold: 3,
            ..ConsumerOptions::default()
        },
        queue_name.clone(),
        Arc::new(handler),
    )
    .expect("consumer");
    let counters = consumer.counters();
    let shutdown = consumer.shutdown_token();
    let worker = tokio::spawn(async move { consumer.run().await });

    let acked = wait_for(Duration::from_secs(5), || {
        counters.acks.load(Ordering::Relaxed) == 1
    })
    .await;
    assert!(acked, "record should be acknowledged on the third attempt");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Every invocation carried the same payload.
    assert_eq!(*seen.lock(), vec![json!("X"), json!("X"), json!("X")]);

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.failed, 2);
    assert_eq!(snapshot.requeued, 2);
    assert_eq!(snapshot.dead_lettered, 0);

    shutdown.cancel();
    worker.await.expect("join").expect("clean shutdown");

    let depths = queue::queue_depths(&pool, &queue_name).await.expect("depths");
    assert_eq!(depths.total(), 0);

    queue::purge(&pool, &queue_name).await.expect("purge");
}

#[tokio::test]
async fn test_exhausted_retries_go_to_dlq() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available. Set TEST_REDIS_URL to enable.");
        return;
    }

    let queue_name = unique_queue("dlq");
    let pool = helpers::create_test_pool();
    let producer = Producer::new(pool.clone(), queue_name.clone());
    producer.produce(json!("Y")).await.expect("produce");

    // Never succeeds; threshold 2 allows exactly two invocations.
    let handler = FailTimesHandler::new(u32::MAX);
    let calls = handler.calls();
    let consumer = Consumer::new(
        test_config(),
        ConsumerOptions {
            message_retry_threshold: 2,
            ..ConsumerOptions::default()
        },
        queue_name.clone(),
        Arc::new(handler),
    )
    .expect("consumer");
    let counters = consumer.counters();
    let shutdown = consumer.shutdown_token();
    let worker = tokio::spawn(async move { consumer.run().await });

    let dead_lettered = wait_for(Duration::from_secs(5), || {
        counters.dead_lettered.load(Ordering::Relaxed) == 1
    })
    .await;
    assert!(dead_lettered, "record should be dead-lettered");

    // No further dispatch once the record is in the DLQ.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    shutdown.cancel();
    worker.await.expect("join").expect("clean shutdown");

    let keys = QueueKeys::new(queue_name.clone());
    let mut conn = pool.get().await.expect("conn");
    let dlq: Vec<String> = conn.lrange(keys.dlq(), 0, -1).await.expect("dlq");
    assert_eq!(dlq.len(), 1);
    let record = Message::from_json(&dlq[0]).expect("record");
    assert_eq!(record.data, json!("Y"));
    assert_eq!(record.attempts, 2);

    let depths = queue::queue_depths(&pool, &queue_name).await.expect("depths");
    assert_eq!(depths.pending, 0);
    assert_eq!(depths.dead_lettered, 1);

    queue::purge(&pool, &queue_name).await.expect("purge");
}
