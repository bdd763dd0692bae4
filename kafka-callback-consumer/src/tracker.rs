use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::backpressure::BackpressureGate;
use crate::epoch::EpochGuard;
use crate::offset_tracker::OffsetTracker;
use crate::types::{Message, Partition};

/// What happened to a message once synchronous dispatch resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Marked finished, eligible for commit
    Finished,
    /// A handler failed and failures may not be committed; the consumer cannot
    /// keep working
    Unrecoverable,
    /// The partition was revoked while processing; nothing was recorded
    Stale,
}

/// Tracks in-flight messages across offsets, bytes and epochs.
///
/// Every mutation of the offset tracker or the byte counters goes through
/// here while holding the epoch lock (read side for message bookkeeping, write
/// side for revocation), which is the only coordination discipline the
/// consumer relies on.
pub struct InFlightTracker {
    epoch: EpochGuard,
    offsets: OffsetTracker,
    gate: BackpressureGate,
    /// Bytes admitted and not yet released, per partition
    partition_bytes: DashMap<Partition, u64>,
    /// Work items admitted and not yet done dispatching
    queue_depth: AtomicUsize,
    commit_on_failure: bool,
    assignment: Mutex<Vec<Partition>>,
}

impl InFlightTracker {
    pub fn new(gate: BackpressureGate, commit_on_failure: bool) -> Self {
        Self {
            epoch: EpochGuard::new(),
            offsets: OffsetTracker::new(),
            gate,
            partition_bytes: DashMap::new(),
            queue_depth: AtomicUsize::new(0),
            commit_on_failure,
            assignment: Mutex::new(Vec::new()),
        }
    }

    pub fn epoch(&self) -> &EpochGuard {
        &self.epoch
    }

    pub fn offsets(&self) -> &OffsetTracker {
        &self.offsets
    }

    pub fn gate(&self) -> &BackpressureGate {
        &self.gate
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    pub fn assignment(&self) -> Vec<Partition> {
        self.assignment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record a received message as started and account for its bytes.
    /// Returns the epoch the message belongs to.
    pub fn admit(&self, message: &Message) -> u64 {
        let epoch = self.epoch.read();
        let partition = message.partition_key();
        let size = message.size as u64;
        self.offsets.mark_started(&partition, message.offset);
        *self.partition_bytes.entry(partition).or_insert(0) += size;
        self.queue_depth.fetch_add(1, Ordering::SeqCst);
        self.gate.admit(size);
        epoch.current()
    }

    /// Whether work of `partition` admitted under `epoch` still counts, i.e.
    /// the partition was not revoked since.
    pub fn is_current(&self, partition: &Partition, epoch: u64) -> bool {
        self.epoch.read().is_current(partition, epoch)
    }

    /// Bytes of `partition` admitted and not yet released
    pub fn partition_bytes(&self, partition: &Partition) -> u64 {
        self.partition_bytes
            .get(partition)
            .map(|bytes| *bytes)
            .unwrap_or(0)
    }

    fn release_bytes(&self, message: &Message) {
        let size = message.size as u64;
        if let Some(mut bytes) = self.partition_bytes.get_mut(&message.partition_key()) {
            *bytes = bytes.saturating_sub(size);
        }
        self.gate.release(size);
    }

    /// Resolve a synchronously dispatched message.
    pub fn complete_sync(&self, message: &Message, epoch: u64, succeeded: bool) -> Completion {
        let Some(_guard) = self
            .epoch
            .read_if_current(&message.partition_key(), epoch)
        else {
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Message completed after revocation, ignoring"
            );
            return Completion::Stale;
        };

        self.release_bytes(message);
        if succeeded || self.commit_on_failure {
            self.offsets
                .mark_processed(&message.partition_key(), message.offset);
            Completion::Finished
        } else {
            Completion::Unrecoverable
        }
    }

    /// Settle an asynchronously acknowledged message. Callers hold the read
    /// side of the epoch lock and have checked the epoch.
    pub(crate) fn settle_async(&self, message: &Message, failed: bool) {
        if failed {
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Message had a permanently failed callback, its offset will not be committed"
            );
        } else {
            self.offsets
                .mark_processed(&message.partition_key(), message.offset);
        }
        self.release_bytes(message);
    }

    /// A work item finished dispatching (or was discarded). In synchronous
    /// mode an empty queue resumes intake.
    pub fn work_item_done(&self, resume_on_drain: bool) {
        let previous = self
            .queue_depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                Some(depth.saturating_sub(1))
            })
            .unwrap_or(0);

        if resume_on_drain && previous <= 1 {
            debug!("Processing queue drained");
            self.gate.resume();
        }
    }

    pub fn resume_if_below_ceiling(&self) {
        self.gate.resume_if_below_ceiling();
    }

    pub fn on_assigned(&self, partitions: &[Partition]) {
        let mut assignment = self.assignment.lock().unwrap_or_else(PoisonError::into_inner);
        for partition in partitions {
            if !assignment.contains(partition) {
                assignment.push(partition.clone());
            }
        }
        info!(
            assigned = partitions.len(),
            total = assignment.len(),
            "Partitions assigned"
        );
    }

    /// Resume intake, invalidate the work the revoked partitions admitted so
    /// far and drop their offsets and bytes without committing them. Work of
    /// the partitions kept is not affected.
    pub fn revoke(&self, partitions: &[Partition]) {
        self.gate.resume();

        let epoch = self.epoch.revoke(partitions);
        for partition in partitions {
            self.offsets.clear_partition(partition);
            if let Some((_, bytes)) = self.partition_bytes.remove(partition) {
                self.gate.release(bytes);
            }
        }

        self.assignment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|partition| !partitions.contains(partition));

        info!(
            revoked = partitions.len(),
            epoch = epoch.current(),
            "Partitions revoked, their queued work discarded"
        );
    }

    /// Forget everything (disconnect). The epoch advances so that late
    /// acknowledgements stay rejected.
    pub fn reset(&self) {
        let _epoch = self.epoch.reset();
        self.offsets.clear_all();
        self.partition_bytes.clear();
        self.gate.reset();
        self.gate.clear_paused();
        self.queue_depth.store(0, Ordering::SeqCst);
        self.assignment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
