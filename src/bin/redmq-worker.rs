//! Worker process: runs one consumer against one queue.
//!
//! Configuration comes from `REDMQ_*` environment variables; `REDMQ_QUEUE`
//! names the queue to consume. The bundled handler logs each payload and
//! acknowledges it — replace it with your own [`MessageHandler`] when using
//! this binary as a template.
//!
//! Exit codes: 0 on clean signal-triggered shutdown; nonzero on
//! misconfiguration, zombie detection, or Redis unavailability beyond the
//! failure budget.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use redmq::config::{BrokerConfig, ConsumerOptions};
use redmq::consumer::{Consumer, MessageHandler};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, payload: Value) -> Result<()> {
        info!(%payload, "Handled message");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let queue_name = match std::env::var("REDMQ_QUEUE") {
        Ok(name) if !name.trim().is_empty() => name,
        _ => {
            eprintln!("REDMQ_QUEUE must name the queue to consume");
            std::process::exit(1);
        }
    };

    let config = match BrokerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };
    let options = match ConsumerOptions::from_env() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    let consumer = Consumer::new(config, options, queue_name, Arc::new(LoggingHandler))?;

    let shutdown = consumer.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    consumer.run().await?;
    Ok(())
}
