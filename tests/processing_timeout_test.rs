//! Processing-timeout watchdog tests against a real Redis.

mod helpers;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use redmq::config::ConsumerOptions;
use redmq::consumer::Consumer;
use redmq::producer::Producer;
use redmq::queue;
use serde_json::json;

use helpers::{SleepyHandler, redis_available, test_config, unique_queue, wait_for};

#[tokio::test]
async fn test_slow_handler_times_out_and_dead_letters() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available. Set TEST_REDIS_URL to enable.");
        return;
    }

    let queue_name = unique_queue("timeout");
    let pool = helpers::create_test_pool();
    let producer = Producer::new(pool.clone(), queue_name.clone());
    producer.produce(json!("Z")).await.expect("produce");

    // Sleeps well past the 100ms budget; every attempt times out, and with
    // threshold 2 the second timeout dead-letters the record.
    let handler = SleepyHandler::new(Duration::from_millis(500));
    let calls = handler.calls();
    let consumer = Consumer::new(
        test_config(),
        ConsumerOptions {
            message_consume_timeout: 100,
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
    assert!(dead_lettered, "record should be dead-lettered after two timeouts");

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let snapshot = counters.snapshot();
    assert_eq!(snapshot.failed, 2);
    assert_eq!(snapshot.requeued, 1);
    // The late acks from the detached handler tasks are ignored.
    assert_eq!(snapshot.acks, 0);

    shutdown.cancel();
    worker.await.expect("join").expect("clean shutdown");

    let depths = queue::queue_depths(&pool, &queue_name).await.expect("depths");
    assert_eq!(depths.pending, 0);
    assert_eq!(depths.dead_lettered, 1);

    queue::purge(&pool, &queue_name).await.expect("purge");
}

#[tokio::test]
async fn test_fast_handler_is_unaffected_by_watchdog() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available. Set TEST_REDIS_URL to enable.");
        return;
    }

    let queue_name = unique_queue("fast");
    let pool = helpers::create_test_pool();
    let producer = Producer::new(pool.clone(), queue_name.clone());
    producer.produce(json!("quick")).await.expect("produce");

    let handler = SleepyHandler::new(Duration::from_millis(10));
    let consumer = Consumer::new(
        test_config(),
        ConsumerOptions {
            message_consume_timeout: 1_000,
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
    assert!(acked);
    assert_eq!(counters.snapshot().failed, 0);

    shutdown.cancel();
    worker.await.expect("join").expect("clean shutdown");

    queue::purge(&pool, &queue_name).await.expect("purge");
}
