//! Offset Tracker - Tracks started and finished offsets per partition
//!
//! Messages of one partition may finish in any order, but the broker only
//! understands a single resume point. The tracker records every offset that
//! started processing and only reports the largest offset whose predecessors
//! (as far as this consumer has seen them) are all finished.

use std::collections::{BTreeMap, HashMap};

use dashmap::DashMap;
use tracing::debug;

use crate::types::Partition;

/// State tracked per partition
#[derive(Default)]
struct PartitionState {
    /// Offsets that started processing and are not yet part of the safe
    /// prefix, with their finished flag
    in_flight: BTreeMap<i64, bool>,
    /// Largest offset with every tracked predecessor finished
    safe_offset: Option<i64>,
    /// Last offset handed to the broker
    committed_offset: Option<i64>,
}

impl PartitionState {
    /// Pop the finished prefix and advance the safe offset past it
    fn advance(&mut self) {
        while let Some(entry) = self.in_flight.first_entry() {
            if !*entry.get() {
                break;
            }
            let (offset, _) = entry.remove_entry();
            self.safe_offset = Some(offset);
        }
    }
}

/// Thread-safe tracker for in-flight offsets per partition.
///
/// The commit loop periodically queries this tracker for offsets that are safe
/// to commit; revocation drops a partition's state without committing it.
#[derive(Default)]
pub struct OffsetTracker {
    partition_state: DashMap<Partition, PartitionState>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `offset` was admitted for processing.
    pub fn mark_started(&self, partition: &Partition, offset: i64) {
        self.partition_state
            .entry(partition.clone())
            .or_default()
            .in_flight
            .insert(offset, false);
    }

    /// Mark an admitted offset as finished. Offsets that were never started
    /// (or whose partition was cleared since) are ignored.
    pub fn mark_processed(&self, partition: &Partition, offset: i64) {
        let Some(mut state) = self.partition_state.get_mut(partition) else {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset,
                "Ignoring completion for untracked partition"
            );
            return;
        };

        match state.in_flight.get_mut(&offset) {
            Some(finished) => *finished = true,
            None => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset,
                    "Ignoring completion for untracked offset"
                );
                return;
            }
        }

        let previous = state.safe_offset;
        state.advance();
        if state.safe_offset != previous {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                previous_offset = ?previous,
                new_offset = ?state.safe_offset,
                "Advancing safe offset"
            );
        }
    }

    /// Offsets ready for commit: per partition, the safe offset if it moved
    /// since the last call to [`OffsetTracker::mark_committed`].
    pub fn get_committable_offsets(&self) -> HashMap<Partition, i64> {
        self.partition_state
            .iter()
            .filter_map(|entry| {
                let state = entry.value();
                match (state.safe_offset, state.committed_offset) {
                    (Some(safe), Some(committed)) if safe <= committed => None,
                    (Some(safe), _) => Some((entry.key().clone(), safe)),
                    (None, _) => None,
                }
            })
            .collect()
    }

    pub fn mark_committed(&self, offsets: &HashMap<Partition, i64>) {
        for (partition, offset) in offsets {
            if let Some(mut state) = self.partition_state.get_mut(partition) {
                let committed = state.committed_offset.map_or(*offset, |c| c.max(*offset));
                state.committed_offset = Some(committed);
            }
        }
    }

    /// Get the safe offset for a specific partition
    pub fn get_partition_offset(&self, partition: &Partition) -> Option<i64> {
        self.partition_state
            .get(partition)
            .and_then(|state| state.safe_offset)
    }

    /// Number of offsets started but not yet part of the safe prefix
    pub fn in_flight_count(&self, partition: &Partition) -> usize {
        self.partition_state
            .get(partition)
            .map(|state| state.in_flight.len())
            .unwrap_or(0)
    }

    /// Clear offset tracking for a partition (during revocation). Nothing is
    /// committed; finished but uncommitted work is redelivered to the next owner.
    pub fn clear_partition(&self, partition: &Partition) {
        if self.partition_state.remove(partition).is_some() {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Cleared offset tracking for revoked partition"
            );
        }
    }

    /// Clear all partitions (during shutdown)
    pub fn clear_all(&self) {
        self.partition_state.clear();
    }

    /// Get the number of partitions being tracked
    pub fn partition_count(&self) -> usize {
        self.partition_state.len()
    }
}
