use std::sync::{Arc, OnceLock};

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::kafka::client::RebalanceHandler;
use crate::metrics_consts::REBALANCE_EMPTY_SKIPPED;
use crate::types::Partition;

/// rdkafka consumer context forwarding rebalances to the callback consumer.
///
/// The handler is installed when the client connects; rebalances that happen
/// before that (there should be none, nothing is subscribed yet) are only
/// logged.
#[derive(Default)]
pub struct CallbackConsumerContext {
    rebalance_handler: OnceLock<Arc<dyn RebalanceHandler>>,
}

impl CallbackConsumerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a handler was already installed.
    pub fn set_rebalance_handler(&self, handler: Arc<dyn RebalanceHandler>) -> bool {
        self.rebalance_handler.set(handler).is_ok()
    }

    fn handler(&self) -> Option<&Arc<dyn RebalanceHandler>> {
        let handler = self.rebalance_handler.get();
        if handler.is_none() {
            warn!("Rebalance received before a rebalance handler was installed");
        }
        handler
    }
}

fn partitions_of(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements().into_iter().map(Partition::from).collect()
}

impl ClientContext for CallbackConsumerContext {}

impl ConsumerContext for CallbackConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // cooperative-sticky sends empty revokes on every membership change
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "revoke")
                        .increment(1);
                    return;
                }

                info!("Revoking {} partitions", partitions.count());
                if let Some(handler) = self.handler() {
                    handler.on_partitions_revoked(&partitions_of(partitions));
                }
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                warn!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty assign rebalance");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "assign")
                        .increment(1);
                    return;
                }

                info!("Assigned {} partitions", partitions.count());
                if let Some(handler) = self.handler() {
                    handler.on_partitions_assigned(&partitions_of(partitions));
                }
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(_) => {
                debug!(
                    "Successfully committed offsets for {} partitions",
                    offsets.count()
                );
            }
            Err(e) => {
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::Offset;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        assigned: Mutex<Vec<Partition>>,
        revoked: Mutex<Vec<Partition>>,
    }

    impl RebalanceHandler for RecordingHandler {
        fn on_partitions_assigned(&self, partitions: &[Partition]) {
            self.assigned.lock().unwrap().extend_from_slice(partitions);
        }

        fn on_partitions_revoked(&self, partitions: &[Partition]) {
            self.revoked.lock().unwrap().extend_from_slice(partitions);
        }
    }

    #[test]
    fn test_partitions_of_topic_partition_list() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset("test-topic-1", 0, Offset::Beginning)
            .unwrap();
        tpl.add_partition_offset("test-topic-2", 3, Offset::Beginning)
            .unwrap();

        let partitions = partitions_of(&tpl);
        assert_eq!(
            partitions,
            vec![
                Partition::new("test-topic-1", 0),
                Partition::new("test-topic-2", 3)
            ]
        );
    }

    #[test]
    fn test_handler_can_only_be_installed_once() {
        let context = CallbackConsumerContext::new();
        let first = Arc::new(RecordingHandler::default());
        let second = Arc::new(RecordingHandler::default());

        assert!(context.set_rebalance_handler(first.clone()));
        assert!(!context.set_rebalance_handler(second));

        context
            .handler()
            .unwrap()
            .on_partitions_revoked(&[Partition::new("t", 0)]);
        assert_eq!(first.revoked.lock().unwrap().len(), 1);
        assert!(first.assigned.lock().unwrap().is_empty());
    }
}
