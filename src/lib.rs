//! # redmq
//!
//! redmq is a persistent message queue layered over Redis. Producers publish
//! opaque JSON payloads to named queues; consumer processes, possibly on
//! different hosts, pull records in FIFO order, run a user-supplied handler,
//! and acknowledge or fail each one. The broker provides at-least-once
//! delivery with idempotent acknowledgment, time-bounded processing, bounded
//! retries with a dead-letter sink, optional per-message TTL, and automatic
//! recovery of records abandoned by crashed consumers.
//!
//! ## Architecture Overview
//!
//! Records flow `pending list → per-consumer in-flight list → handler`, then
//! are deleted on ack or routed by the retry policy on failure. The pending
//! to in-flight step is a single atomic blocking move, and every two-list
//! transition after that runs as a server-side script, so a record is never
//! in two places or in none.
//!
//! Each consumer refreshes a volatile liveness token on a heartbeat. A
//! garbage collector — elected per queue through a volatile lease — drains
//! the in-flight lists of consumers whose token has lapsed, re-queueing or
//! dead-lettering each record. A consumer that discovers its own token
//! expired treats itself as a zombie and exits rather than race the GC.
//!
//! Statistics are written to per-consumer Redis hashes on an interval for an
//! external monitor; that path is advisory and never affects delivery.
//!
//! ## Error Handling
//!
//! All error strings use the format: `error-redmq-<domain>-<number> <message>`
//!
//! ## Examples
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use redmq::{
//!     config::{BrokerConfig, ConsumerOptions},
//!     consumer::{Consumer, MessageHandler},
//!     producer::Producer,
//! };
//!
//! struct PrintHandler;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for PrintHandler {
//!     async fn handle(&self, payload: serde_json::Value) -> anyhow::Result<()> {
//!         println!("got {payload}");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BrokerConfig::from_env()?;
//!
//!     let producer = Producer::new(config.create_pool()?, "orders");
//!     producer.produce(serde_json::json!({"order": 42})).await?;
//!
//!     let consumer = Consumer::new(
//!         config,
//!         ConsumerOptions::default(),
//!         "orders",
//!         Arc::new(PrintHandler),
//!     )?;
//!     consumer.run().await?;
//!     Ok(())
//! }
//! ```

/// Broker configuration and per-consumer options.
///
/// Loaded from `REDMQ_*` environment variables or built as struct literals;
/// validation failures are fatal before any message is touched.
pub mod config;

pub(crate) mod constants;

/// Consumer runtime: pull loop, heartbeat, retry policy, zombie detection,
/// and graceful shutdown.
pub mod consumer;

pub(crate) mod errors;

/// Garbage collection: lease-elected reclamation of dead consumers'
/// in-flight records and expired-TTL sweeping.
pub(crate) mod gc;

/// Redis key layout shared by every component.
pub mod keyspace;

/// The serializable message record envelope.
pub mod message;

/// Stateless message producer.
pub mod producer;

/// Queue registry, depth inspection, and purge helpers.
pub mod queue;

pub(crate) mod scripts;

/// Delivery counters and their periodic publication to Redis.
pub mod stats;

pub(crate) mod watchdog;

pub use errors::{ConfigError, ConsumerError, ProducerError, QueueError, SerializationError};
