//! Broker and consumer configuration.
//!
//! Configuration is loaded from environment variables (`REDMQ_*`) or built
//! as struct literals for embedding. Only the Redis settings affect queue
//! correctness; every interval has a safe default. Validation failures are
//! fatal before any message is touched.

use std::time::Duration;

use deadpool_redis::{Pool, Runtime};
use tracing::warn;

use crate::constants::{
    ALIVE_TTL_HEARTBEATS, DEFAULT_GC_INTERVAL_MS, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_PULL_TIMEOUT_MS, DEFAULT_RETRY_THRESHOLD, DEFAULT_SHUTDOWN_GRACE_MS,
    DEFAULT_STATS_INTERVAL_MS, DEFAULT_TRANSPORT_FAILURE_BUDGET, GC_LEASE_TICKS,
};
use crate::errors::{ConfigError, QueueError};

type Result<T> = std::result::Result<T, ConfigError>;

/// Process-wide broker settings shared by producers and consumers.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379`.
    pub redis_url: String,
    /// Liveness heartbeat interval. The alive token expires after three
    /// missed heartbeats.
    pub heartbeat_interval: Duration,
    /// Garbage-collection tick interval. The GC lease expires after two
    /// missed ticks.
    pub gc_interval: Duration,
    /// Statistics publication interval (advisory path).
    pub stats_interval: Duration,
    /// Server-side timeout for the blocking pull; bounds shutdown latency.
    pub pull_timeout: Duration,
    /// How long an in-progress handler may run after shutdown is requested
    /// before its record is abandoned to GC reclamation.
    pub shutdown_grace: Duration,
    /// Consecutive transport failures tolerated before the consumer exits.
    pub transport_failure_budget: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            gc_interval: Duration::from_millis(DEFAULT_GC_INTERVAL_MS),
            stats_interval: Duration::from_millis(DEFAULT_STATS_INTERVAL_MS),
            pull_timeout: Duration::from_millis(DEFAULT_PULL_TIMEOUT_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            transport_failure_budget: DEFAULT_TRANSPORT_FAILURE_BUDGET,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from `REDMQ_*` environment variables.
    ///
    /// `REDMQ_REDIS_URL` is required; everything else falls back to
    /// defaults. Interval variables are milliseconds.
    pub fn from_env() -> Result<Self> {
        let redis_url =
            std::env::var("REDMQ_REDIS_URL").map_err(|_| ConfigError::EnvVarRequired {
                var_name: "REDMQ_REDIS_URL".to_string(),
            })?;

        let defaults = Self::default();
        let config = Self {
            redis_url,
            heartbeat_interval: interval_from_env(
                "REDMQ_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            )?,
            gc_interval: interval_from_env("REDMQ_GC_INTERVAL_MS", defaults.gc_interval)?,
            stats_interval: interval_from_env("REDMQ_STATS_INTERVAL_MS", defaults.stats_interval)?,
            pull_timeout: interval_from_env("REDMQ_PULL_TIMEOUT_MS", defaults.pull_timeout)?,
            shutdown_grace: interval_from_env("REDMQ_SHUTDOWN_GRACE_MS", defaults.shutdown_grace)?,
            transport_failure_budget: match std::env::var("REDMQ_TRANSPORT_FAILURE_BUDGET") {
                Ok(value) => value.parse::<u32>().map_err(|_| ConfigError::InvalidInterval {
                    var_name: "REDMQ_TRANSPORT_FAILURE_BUDGET".to_string(),
                    value,
                })?,
                Err(_) => defaults.transport_failure_budget,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate interval relationships.
    pub fn validate(&self) -> Result<()> {
        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::InvalidRedisUrl {
                details: "Redis URL cannot be empty".to_string(),
            });
        }
        for (name, interval) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("gc_interval", self.gc_interval),
            ("stats_interval", self.stats_interval),
            ("pull_timeout", self.pull_timeout),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::InvalidInterval {
                    var_name: name.to_string(),
                    value: "0".to_string(),
                });
            }
        }
        if self.transport_failure_budget == 0 {
            return Err(ConfigError::InvalidInterval {
                var_name: "transport_failure_budget".to_string(),
                value: "0".to_string(),
            });
        }
        if self.pull_timeout > self.alive_ttl() {
            warn!(
                pull_timeout_ms = self.pull_timeout.as_millis() as u64,
                alive_ttl_ms = self.alive_ttl().as_millis() as u64,
                "Pull timeout exceeds liveness TTL; idle consumers may be reclaimed"
            );
        }
        Ok(())
    }

    /// Expiry of the per-consumer liveness token.
    pub fn alive_ttl(&self) -> Duration {
        self.heartbeat_interval * ALIVE_TTL_HEARTBEATS
    }

    /// Expiry of the per-queue GC lease.
    pub fn gc_lease_ttl(&self) -> Duration {
        self.gc_interval * GC_LEASE_TICKS
    }

    /// Create a Redis connection pool for the control plane.
    pub fn create_pool(&self) -> std::result::Result<Pool, QueueError> {
        deadpool_redis::Config::from_url(&self.redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| QueueError::ConnectionFailed {
                details: e.to_string(),
            })
    }
}

/// Per-consumer message-handling options.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Wall-clock budget for one handler invocation in milliseconds;
    /// 0 disables the watchdog.
    pub message_consume_timeout: u64,
    /// Default TTL in milliseconds applied at dispatch to records that carry
    /// none of their own; 0 disables. Never written back to the record.
    pub message_ttl: u64,
    /// Maximum delivery attempts before dead-lettering. Must be at least 1.
    pub message_retry_threshold: u32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            message_consume_timeout: 0,
            message_ttl: 0,
            message_retry_threshold: DEFAULT_RETRY_THRESHOLD,
        }
    }
}

impl ConsumerOptions {
    /// Load options from `REDMQ_MESSAGE_*` environment variables, falling
    /// back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let options = Self {
            message_consume_timeout: ms_from_env(
                "REDMQ_MESSAGE_CONSUME_TIMEOUT_MS",
                defaults.message_consume_timeout,
            )?,
            message_ttl: ms_from_env("REDMQ_MESSAGE_TTL_MS", defaults.message_ttl)?,
            message_retry_threshold: match std::env::var("REDMQ_MESSAGE_RETRY_THRESHOLD") {
                Ok(value) => {
                    value
                        .parse::<u32>()
                        .map_err(|_| ConfigError::InvalidRetryThreshold {
                            value: value.clone(),
                        })?
                }
                Err(_) => defaults.message_retry_threshold,
            },
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.message_retry_threshold == 0 {
            return Err(ConfigError::InvalidRetryThreshold {
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn interval_from_env(var_name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(ms_from_env(
        var_name,
        default.as_millis() as u64,
    )?))
}

fn ms_from_env(var_name: &str, default: u64) -> Result<u64> {
    match std::env::var(var_name) {
        Ok(value) => value.parse::<u64>().map_err(|_| ConfigError::InvalidInterval {
            var_name: var_name.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BrokerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.alive_ttl(), Duration::from_secs(3));
        assert_eq!(config.gc_lease_ttl(), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = BrokerConfig {
            heartbeat_interval: Duration::ZERO,
            ..BrokerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn test_empty_redis_url_rejected() {
        let config = BrokerConfig {
            redis_url: "  ".to_string(),
            ..BrokerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRedisUrl { .. })
        ));
    }

    #[test]
    fn test_default_options_are_valid() {
        let options = ConsumerOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.message_retry_threshold, 3);
    }

    #[test]
    fn test_zero_retry_threshold_rejected() {
        let options = ConsumerOptions {
            message_retry_threshold: 0,
            ..ConsumerOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidRetryThreshold { .. })
        ));
    }
}
