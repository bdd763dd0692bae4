// Kafka module - the broker client seam and its rdkafka implementation
pub mod client;
pub mod config;
pub mod context;
pub mod rdkafka_client;

// Public API
pub use client::{BrokerClient, RebalanceHandler};
pub use config::ConsumerConfigBuilder;
pub use rdkafka_client::KafkaBrokerClient;
