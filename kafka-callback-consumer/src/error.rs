use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Failures reported by a [`crate::kafka::BrokerClient`].
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("broker request failed: {0}")]
    Request(String),

    #[error("broker client is closed")]
    Closed,

    #[error("broker request timed out")]
    Timeout,
}

/// Rejected option values, returned by [`crate::config::ConsumerOptionsBuilder::build`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },

    #[error("subscription backoff minimum ({min_ms}ms) exceeds maximum ({max_ms}ms)")]
    BackoffRange { min_ms: u64, max_ms: u64 },
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to connect to kafka: {0}")]
    Connecting(#[source] BrokerError),

    #[error("disconnection timeout after {0:?}")]
    DisconnectTimeout(Duration),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid topic pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("consumer was already initialized")]
    AlreadyInitialized,
}
