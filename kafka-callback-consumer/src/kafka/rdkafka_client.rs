use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::error::BrokerError;
use crate::kafka::client::{BrokerClient, RebalanceHandler};
use crate::kafka::context::CallbackConsumerContext;
use crate::types::{BrokerInfo, ClusterMetadata, ConsumerStatus, Message, Partition, TopicInfo};

/// [`BrokerClient`] backed by an rdkafka `StreamConsumer`.
///
/// librdkafka has no explicit disconnect; the underlying consumer leaves the
/// group when the last reference to this client is dropped. `disconnect` only
/// closes the client for receiving, and a later `connect` opens it again.
pub struct KafkaBrokerClient {
    consumer: Arc<StreamConsumer<CallbackConsumerContext>>,
    connect_timeout: Duration,
    closed: AtomicBool,
}

impl KafkaBrokerClient {
    pub fn new(config: &ClientConfig, connect_timeout: Duration) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer<CallbackConsumerContext> =
            config.create_with_context(CallbackConsumerContext::new())?;

        Ok(Self {
            consumer: Arc::new(consumer),
            connect_timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn fetch_metadata(&self, timeout: Duration) -> Result<ClusterMetadata, BrokerError> {
        let consumer = self.consumer.clone();
        // fetch_metadata blocks the calling thread
        let metadata = tokio::task::spawn_blocking(move || consumer.fetch_metadata(None, timeout))
            .await
            .map_err(|e| BrokerError::Request(format!("metadata task failed: {e}")))?
            .map_err(metadata_error)?;

        Ok(ClusterMetadata {
            brokers: metadata
                .brokers()
                .iter()
                .map(|b| BrokerInfo {
                    id: b.id(),
                    host: b.host().to_string(),
                    port: b.port(),
                })
                .collect(),
            topics: metadata
                .topics()
                .iter()
                .map(|t| TopicInfo {
                    name: t.name().to_string(),
                    partitions: t.partitions().len(),
                })
                .collect(),
        })
    }
}

fn metadata_error(e: KafkaError) -> BrokerError {
    match e {
        KafkaError::MetadataFetch(RDKafkaErrorCode::OperationTimedOut) => BrokerError::Timeout,
        e => BrokerError::Kafka(e),
    }
}

fn to_partition_list(partitions: &[Partition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for partition in partitions {
        tpl.add_partition(partition.topic(), partition.partition_number());
    }
    tpl
}

#[async_trait]
impl BrokerClient for KafkaBrokerClient {
    async fn connect(&self, rebalance_handler: Arc<dyn RebalanceHandler>) -> Result<(), BrokerError> {
        if !self.consumer.context().set_rebalance_handler(rebalance_handler) {
            debug!("Rebalance handler already installed, keeping the existing one");
        }
        self.closed.store(false, Ordering::SeqCst);

        let metadata = self.fetch_metadata(self.connect_timeout).await?;
        info!(
            brokers = metadata.brokers.len(),
            topics = metadata.topics.len(),
            "Connected to kafka"
        );
        Ok(())
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;
        Ok(())
    }

    fn unsubscribe(&self) -> Result<(), BrokerError> {
        self.consumer.unsubscribe();
        Ok(())
    }

    async fn recv(&self) -> Result<Message, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let message = self.consumer.recv().await?;
        Ok(Message::from(&message))
    }

    fn pause(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.consumer.pause(&to_partition_list(partitions))?;
        Ok(())
    }

    fn resume(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.consumer.resume(&to_partition_list(partitions))?;
        Ok(())
    }

    fn assignment(&self) -> Result<Vec<Partition>, BrokerError> {
        let assignment = self.consumer.assignment()?;
        Ok(assignment
            .elements()
            .into_iter()
            .map(Partition::from)
            .collect())
    }

    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in offsets {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset + 1,
                "Adding commit offset"
            );
            // Kafka resumes from the committed offset, so commit the next one
            tpl.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(offset + 1),
            )?;
        }

        self.consumer.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }

    async fn status(&self, timeout: Duration) -> ConsumerStatus {
        match self.fetch_metadata(timeout).await {
            Ok(metadata) => ConsumerStatus::connected(metadata),
            Err(e) => {
                debug!("Status probe failed: {}", e);
                ConsumerStatus::disconnected()
            }
        }
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.consumer.unsubscribe();
        info!("Kafka consumer unsubscribed and closed for receiving");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::ConsumerConfigBuilder;

    #[test]
    fn test_to_partition_list() {
        let tpl = to_partition_list(&[Partition::new("a", 0), Partition::new("b", 2)]);
        assert_eq!(tpl.count(), 2);
        assert!(tpl.find_partition("a", 0).is_some());
        assert!(tpl.find_partition("b", 2).is_some());
        assert!(tpl.find_partition("b", 0).is_none());
    }

    #[test]
    fn test_metadata_timeout_maps_to_timeout() {
        let error = metadata_error(KafkaError::MetadataFetch(
            RDKafkaErrorCode::OperationTimedOut,
        ));
        assert!(matches!(error, BrokerError::Timeout));

        let error = metadata_error(KafkaError::MetadataFetch(RDKafkaErrorCode::BrokerNotAvailable));
        assert!(matches!(error, BrokerError::Kafka(_)));
    }

    #[tokio::test]
    async fn test_connect_reopens_disconnected_client() {
        let config = ConsumerConfigBuilder::new("localhost:1", "reopen-test").build();
        let client = KafkaBrokerClient::new(&config, Duration::from_millis(100)).unwrap();

        client.disconnect().await.unwrap();
        assert!(client.is_closed());
        assert!(matches!(client.recv().await, Err(BrokerError::Closed)));

        // nothing listens on the port, so the metadata round-trip fails, but
        // the client is open for receiving again
        let handler: Arc<dyn RebalanceHandler> = Arc::new(NoopRebalance);
        assert!(client.connect(handler).await.is_err());
        assert!(!client.is_closed());
    }

    struct NoopRebalance;

    impl RebalanceHandler for NoopRebalance {
        fn on_partitions_assigned(&self, _partitions: &[Partition]) {}

        fn on_partitions_revoked(&self, _partitions: &[Partition]) {}
    }
}
