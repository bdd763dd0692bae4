use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::types::{ConsumerStatus, Message, Partition};

/// Receives partition assignment changes.
///
/// Both methods are called synchronously from within the client's rebalance
/// callback, before the broker-side revocation or assignment completes. They
/// MUST be fast and non-blocking.
pub trait RebalanceHandler: Send + Sync {
    fn on_partitions_assigned(&self, partitions: &[Partition]);

    fn on_partitions_revoked(&self, partitions: &[Partition]);
}

/// The log-broker client the consumer drives.
///
/// Offsets passed to [`BrokerClient::commit`] are the last processed offset per
/// partition; implementations translate them to whatever the broker expects
/// (Kafka resumes from `offset + 1`).
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Connect to the cluster. `rebalance_handler` is notified of every
    /// assignment change from then on.
    async fn connect(&self, rebalance_handler: Arc<dyn RebalanceHandler>) -> Result<(), BrokerError>;

    /// Replace the subscription with `topics`. Entries starting with `^` are
    /// regular expressions.
    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    fn unsubscribe(&self) -> Result<(), BrokerError>;

    /// Wait for the next message.
    async fn recv(&self) -> Result<Message, BrokerError>;

    fn pause(&self, partitions: &[Partition]) -> Result<(), BrokerError>;

    fn resume(&self, partitions: &[Partition]) -> Result<(), BrokerError>;

    fn assignment(&self) -> Result<Vec<Partition>, BrokerError>;

    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), BrokerError>;

    /// Probe the cluster. Failures are reported as a disconnected status.
    async fn status(&self, timeout: Duration) -> ConsumerStatus;

    async fn disconnect(&self) -> Result<(), BrokerError>;
}
