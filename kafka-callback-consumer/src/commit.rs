use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::BrokerError;
use crate::kafka::BrokerClient;
use crate::metrics_consts::{OFFSET_COMMITS, PARTITION_LAST_COMMITTED_OFFSET};
use crate::tracker::InFlightTracker;
use crate::types::Partition;

/// Commit Coordinator - periodically commits the safe offset of every
/// partition whose safe offset advanced since the previous commit.
pub struct CommitCoordinator {
    broker: Arc<dyn BrokerClient>,
    tracker: Arc<InFlightTracker>,
}

impl CommitCoordinator {
    pub fn new(broker: Arc<dyn BrokerClient>, tracker: Arc<InFlightTracker>) -> Self {
        Self { broker, tracker }
    }

    /// Commit whatever is safe right now. Returns the committed offsets.
    pub fn commit_pending(&self) -> Result<HashMap<Partition, i64>, BrokerError> {
        // Hold the epoch so a revocation cannot clear a partition between
        // reading its offset and recording the commit
        let _epoch = self.tracker.epoch().read();

        let offsets = self.tracker.offsets().get_committable_offsets();
        if offsets.is_empty() {
            debug!("No safe offsets to commit");
            return Ok(offsets);
        }

        if let Err(e) = self.broker.commit(&offsets) {
            metrics::counter!(OFFSET_COMMITS, "status" => "failure").increment(1);
            return Err(e);
        }

        self.tracker.offsets().mark_committed(&offsets);
        metrics::counter!(OFFSET_COMMITS, "status" => "success").increment(1);
        for (partition, offset) in &offsets {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset,
                "Committed offset"
            );
            metrics::gauge!(
                PARTITION_LAST_COMMITTED_OFFSET,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .set(*offset as f64);
        }

        Ok(offsets)
    }

    /// Commit every `interval` until cancelled. The first commit happens one
    /// full interval after start.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Commit loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.commit_pending() {
                        error!("Failed to commit offsets: {}", e);
                    }
                }
            }
        }
    }
}
