//! Broker-wide constants

/// Namespace prefix for every Redis key the broker owns.
pub(crate) const KEY_NAMESPACE: &str = "redmq";

/// Default maximum number of delivery attempts before dead-lettering.
pub(crate) const DEFAULT_RETRY_THRESHOLD: u32 = 3;

/// Default liveness heartbeat interval.
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Default garbage-collection tick interval.
pub(crate) const DEFAULT_GC_INTERVAL_MS: u64 = 1_000;

/// Default statistics publication interval.
pub(crate) const DEFAULT_STATS_INTERVAL_MS: u64 = 1_000;

/// Default server-side timeout for the blocking pull.
pub(crate) const DEFAULT_PULL_TIMEOUT_MS: u64 = 1_000;

/// Default grace period for an in-progress handler during shutdown.
pub(crate) const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 30_000;

/// Default number of consecutive transport failures before the consumer
/// gives up and exits for a supervisor restart.
pub(crate) const DEFAULT_TRANSPORT_FAILURE_BUDGET: u32 = 10;

/// The liveness token expires after this many missed heartbeats.
pub(crate) const ALIVE_TTL_HEARTBEATS: u32 = 3;

/// The GC lease expires after this many missed ticks.
pub(crate) const GC_LEASE_TICKS: u32 = 2;

/// Base delay for the capped exponential backoff after a transport failure.
pub(crate) const BACKOFF_BASE_MS: u64 = 100;

/// Cap for the exponential backoff after a transport failure.
pub(crate) const BACKOFF_CAP_MS: u64 = 10_000;
