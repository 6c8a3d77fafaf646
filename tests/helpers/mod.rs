//! Shared fixtures for integration tests.
//!
//! All integration tests require a running Redis reachable through
//! `TEST_REDIS_URL`; each test bails out early when it is not set.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::redis;
use parking_lot::Mutex;
use redmq::config::BrokerConfig;
use redmq::consumer::MessageHandler;
use serde_json::Value;

/// Helper to check if Redis is available for testing
pub async fn redis_available() -> bool {
    match std::env::var("TEST_REDIS_URL") {
        Ok(url) => match redis::Client::open(url.as_str()) {
            Ok(client) => client.get_multiplexed_async_connection().await.is_ok(),
            Err(_) => false,
        },
        Err(_) => false,
    }
}

pub fn test_redis_url() -> String {
    std::env::var("TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Broker config with short intervals so recovery paths finish quickly.
pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        redis_url: test_redis_url(),
        heartbeat_interval: Duration::from_millis(200),
        gc_interval: Duration::from_millis(200),
        stats_interval: Duration::from_millis(200),
        pull_timeout: Duration::from_millis(200),
        shutdown_grace: Duration::from_secs(2),
        ..BrokerConfig::default()
    }
}

pub fn create_test_pool() -> deadpool_redis::Pool {
    deadpool_redis::Config::from_url(test_redis_url())
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .expect("Failed to create test Redis pool")
}

pub fn unique_queue(prefix: &str) -> String {
    format!("test-{}-{}", prefix, uuid::Uuid::new_v4())
}

/// Poll `condition` until it holds or `deadline` elapses.
pub async fn wait_for<F>(deadline: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let started = Instant::now();
    while started.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

/// Acknowledges everything and records the payloads in arrival order.
pub struct CollectingHandler {
    seen: Arc<Mutex<Vec<Value>>>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn seen(&self) -> Arc<Mutex<Vec<Value>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl MessageHandler for CollectingHandler {
    async fn handle(&self, payload: Value) -> anyhow::Result<()> {
        self.seen.lock().push(payload);
        Ok(())
    }
}

/// Fails the first `fail_first` invocations, then acknowledges.
pub struct FailTimesHandler {
    fail_first: u32,
    calls: Arc<AtomicU32>,
    seen: Arc<Mutex<Vec<Value>>>,
}

impl FailTimesHandler {
    pub fn new(fail_first: u32) -> Self {
        Self {
            fail_first,
            calls: Arc::new(AtomicU32::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }

    pub fn seen(&self) -> Arc<Mutex<Vec<Value>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl MessageHandler for FailTimesHandler {
    async fn handle(&self, payload: Value) -> anyhow::Result<()> {
        self.seen.lock().push(payload);
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            anyhow::bail!("induced failure {}", call + 1);
        }
        Ok(())
    }
}

/// Sleeps through the watchdog budget, then acknowledges.
pub struct SleepyHandler {
    delay: Duration,
    calls: Arc<AtomicU32>,
}

impl SleepyHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl MessageHandler for SleepyHandler {
    async fn handle(&self, _payload: Value) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}
