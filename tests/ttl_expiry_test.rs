//! TTL expiry tests against a real Redis.

mod helpers;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use redmq::config::ConsumerOptions;
use redmq::consumer::Consumer;
use redmq::producer::Producer;
use redmq::queue;
use serde_json::json;

use helpers::{CollectingHandler, redis_available, test_config, unique_queue, wait_for};

#[tokio::test]
async fn test_expired_pending_record_is_never_dispatched() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available. Set TEST_REDIS_URL to enable.");
        return;
    }

    let queue_name = unique_queue("ttl");
    let pool = helpers::create_test_pool();
    let producer = Producer::new(pool.clone(), queue_name.clone());
    producer
        .produce_with_ttl(json!("P"), 50)
        .await
        .expect("produce");

    // Let the TTL elapse before any consumer exists.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let handler = CollectingHandler::new();
    let seen = handler.seen();
    let consumer = Consumer::new(
        test_config(),
        ConsumerOptions::default(),
        queue_name.clone(),
        Arc::new(handler),
    )
    .expect("consumer");
    let counters = consumer.counters();
    let shutdown = consumer.shutdown_token();
    let worker = tokio::spawn(async move { consumer.run().await });

    let expired = wait_for(Duration::from_secs(5), || {
        counters.expired.load(Ordering::Relaxed) == 1
    })
    .await;
    assert!(expired, "record should be discarded as expired");
    assert!(seen.lock().is_empty(), "handler must never see an expired record");

    shutdown.cancel();
    worker.await.expect("join").expect("clean shutdown");

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.acks, 0);
    assert_eq!(snapshot.dead_lettered, 0);

    let depths = queue::queue_depths(&pool, &queue_name).await.expect("depths");
    assert_eq!(depths.total(), 0, "expired records are deleted, not dead-lettered");

    queue::purge(&pool, &queue_name).await.expect("purge");
}

#[tokio::test]
async fn test_consumer_default_ttl_only_covers_unstamped_records() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available. Set TEST_REDIS_URL to enable.");
        return;
    }

    let queue_name = unique_queue("ttl-default");
    let pool = helpers::create_test_pool();
    let producer = Producer::new(pool.clone(), queue_name.clone());

    // One record with no TTL of its own, one stamped with a generous TTL.
    producer.produce(json!("unstamped")).await.expect("produce");
    producer
        .produce_with_ttl(json!("stamped"), 60_000)
        .await
        .expect("produce");

    // Outlive the consumer's 100ms default before consuming starts.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let handler = CollectingHandler::new();
    let seen = handler.seen();
    let consumer = Consumer::new(
        test_config(),
        ConsumerOptions {
            message_ttl: 100,
            ..ConsumerOptions::default()
        },
        queue_name.clone(),
        Arc::new(handler),
    )
    .expect("consumer");
    let counters = consumer.counters();
    let shutdown = consumer.shutdown_token();
    let worker = tokio::spawn(async move { consumer.run().await });

    let settled = wait_for(Duration::from_secs(5), || {
        counters.acks.load(Ordering::Relaxed) == 1
            && counters.expired.load(Ordering::Relaxed) == 1
    })
    .await;
    assert!(
        settled,
        "default TTL should expire the unstamped record and deliver the stamped one"
    );
    assert_eq!(*seen.lock(), vec![json!("stamped")]);

    shutdown.cancel();
    worker.await.expect("join").expect("clean shutdown");

    let depths = queue::queue_depths(&pool, &queue_name).await.expect("depths");
    assert_eq!(depths.total(), 0);

    queue::purge(&pool, &queue_name).await.expect("purge");
}
