use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error-redmq-config-1 Required environment variable not set: {var_name}")]
    EnvVarRequired { var_name: String },

    #[error("error-redmq-config-2 Invalid Redis URL: {details}")]
    InvalidRedisUrl { details: String },

    #[error("error-redmq-config-3 Invalid interval for {var_name}: {value}")]
    InvalidInterval { var_name: String, value: String },

    #[error("error-redmq-config-4 Invalid retry threshold: {value}")]
    InvalidRetryThreshold { value: String },

    #[error("error-redmq-config-5 Invalid TTL value: {value}")]
    InvalidTtl { value: String },

    #[error("error-redmq-config-6 Invalid queue name: {details}")]
    InvalidQueueName { details: String },
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("error-redmq-queue-1 Redis operation failed: {operation}: {source}")]
    RedisOperationFailed {
        operation: String,
        #[source]
        source: deadpool_redis::redis::RedisError,
    },

    #[error("error-redmq-queue-2 Redis connection failed: {details}")]
    ConnectionFailed { details: String },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("error-redmq-serialization-1 Record serialization failed: {source}")]
    RecordEncodeFailed {
        #[source]
        source: serde_json::Error,
    },

    #[error("error-redmq-serialization-2 Record deserialization failed: {source}")]
    RecordDecodeFailed {
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("error-redmq-producer-1 Message TTL must be greater than zero")]
    ZeroTtl,

    #[error("error-redmq-producer-2 {0}")]
    Serialization(#[from] SerializationError),

    #[error("error-redmq-producer-3 {0}")]
    Transport(#[from] QueueError),
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("error-redmq-consumer-1 Invalid consumer options: {details}")]
    InvalidOptions { details: String },

    #[error(
        "error-redmq-consumer-2 Liveness token expired before refresh; consumer {consumer_id} is a zombie"
    )]
    ZombieDetected { consumer_id: String },

    #[error(
        "error-redmq-consumer-3 Transport failure budget exhausted after {consecutive_failures} consecutive failures: {details}"
    )]
    TransportBudgetExceeded {
        consecutive_failures: u32,
        details: String,
    },

    #[error("error-redmq-consumer-4 Consumer registration failed: {0}")]
    Registration(#[source] QueueError),

    #[error("error-redmq-consumer-5 {0}")]
    Config(#[from] ConfigError),
}
