use std::fmt;

use rdkafka::message::{BorrowedMessage, Message as _, OwnedMessage};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// A record read from the log. Identity is `(topic, partition, offset)`;
/// the consumer never mutates a message once it has been received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    /// Size of the value in bytes, used for backpressure accounting.
    pub size: usize,
    /// Creation timestamp in milliseconds, when the broker provided one.
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            size: value.len(),
            value: Some(value),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    /// Overrides the accounted size, for records whose payload is not the
    /// interesting measure (tests, mostly).
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn partition_key(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }
}

impl From<&BorrowedMessage<'_>> for Message {
    fn from(msg: &BorrowedMessage<'_>) -> Self {
        let value = msg.payload().map(|p| p.to_vec());
        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            size: value.as_ref().map(Vec::len).unwrap_or(0),
            value,
            timestamp: msg.timestamp().to_millis(),
        }
    }
}

impl From<OwnedMessage> for Message {
    fn from(msg: OwnedMessage) -> Self {
        let timestamp = msg.timestamp().to_millis();
        let topic = msg.topic().to_string();
        let partition = msg.partition();
        let offset = msg.offset();
        let key = msg.key().map(|k| k.to_vec());
        let value = msg.payload().map(|p| p.to_vec());
        Self {
            topic,
            partition,
            offset,
            key,
            size: value.as_ref().map(Vec::len).unwrap_or(0),
            value,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerInfo {
    pub id: i32,
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicInfo {
    pub name: String,
    pub partitions: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterMetadata {
    pub brokers: Vec<BrokerInfo>,
    pub topics: Vec<TopicInfo>,
}

/// Result of a status probe. A failed probe is reported as
/// `connected: false`, never as an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatus {
    pub connected: bool,
    pub metadata: Option<ClusterMetadata>,
}

impl ConsumerStatus {
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn connected(metadata: ClusterMetadata) -> Self {
        Self {
            connected: true,
            metadata: Some(metadata),
        }
    }
}
