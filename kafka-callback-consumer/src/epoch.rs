//! Epoch Guard and acknowledgement tokens for asynchronous commit.
//!
//! Every revocation advances the epoch and records, for each revoked
//! partition, the epoch from which its work is valid again. Work a partition
//! admitted before its revocation belongs to an assignment this consumer may
//! no longer own, so its acknowledgements are rejected and never touch the
//! offset or byte accounting. Partitions kept across a rebalance are not
//! affected.
//!
//! The epoch comparison and the accounting update it protects form one
//! critical section: acknowledgements hold the read side of the epoch lock
//! while they decrement and settle, and revocation holds the write side while
//! it advances the epoch and drops the revoked partitions' accounting. A
//! settle can therefore never interleave with a revocation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use tracing::{debug, warn};

use crate::metrics_consts::ACKS_REJECTED;
use crate::registry::RegistrationId;
use crate::tracker::InFlightTracker;
use crate::types::{Message, Partition};

#[derive(Debug, Default)]
pub struct Epochs {
    current: u64,
    /// Work admitted before this epoch is stale on every partition
    floor: u64,
    /// First valid epoch of each partition revoked so far
    revoked_at: HashMap<Partition, u64>,
}

impl Epochs {
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Whether work of `partition` admitted under `epoch` still counts.
    pub fn is_current(&self, partition: &Partition, epoch: u64) -> bool {
        if epoch < self.floor {
            return false;
        }
        match self.revoked_at.get(partition) {
            Some(valid_from) => epoch >= *valid_from,
            None => true,
        }
    }
}

#[derive(Debug, Default)]
pub struct EpochGuard {
    state: RwLock<Epochs>,
}

impl EpochGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.read().current
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Epochs> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read guard held only if work of `partition` admitted under `epoch`
    /// still counts.
    pub fn read_if_current(
        &self,
        partition: &Partition,
        epoch: u64,
    ) -> Option<RwLockReadGuard<'_, Epochs>> {
        let guard = self.read();
        guard.is_current(partition, epoch).then_some(guard)
    }

    /// Advance the epoch and invalidate earlier work of `partitions`. The
    /// write guard is returned so the caller can finish dropping their state
    /// before any acknowledgement observes the new epoch.
    pub fn revoke(&self, partitions: &[Partition]) -> RwLockWriteGuard<'_, Epochs> {
        let mut guard = self.write();
        guard.current += 1;
        let valid_from = guard.current;
        for partition in partitions {
            guard.revoked_at.insert(partition.clone(), valid_from);
        }
        guard
    }

    /// Advance the epoch and invalidate earlier work of every partition.
    pub fn reset(&self) -> RwLockWriteGuard<'_, Epochs> {
        let mut guard = self.write();
        guard.current += 1;
        guard.floor = guard.current;
        guard.revoked_at.clear();
        guard
    }

    fn write(&self) -> RwLockWriteGuard<'_, Epochs> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct PendingState {
    pending: usize,
    failed: bool,
    /// Settled by [`PendingAcks::abandon`]; later acknowledgements are moot
    abandoned: bool,
}

/// Pending-acknowledgement counter of one message.
///
/// Starts at one (the dispatch bias) so it cannot reach zero while handlers
/// are still being invoked, even if some acknowledge synchronously.
#[derive(Debug)]
pub struct PendingAcks {
    message: Arc<Message>,
    partition: Partition,
    epoch: u64,
    state: Mutex<PendingState>,
}

impl PendingAcks {
    pub fn new(message: Arc<Message>, epoch: u64) -> Self {
        let partition = message.partition_key();
        Self {
            message,
            partition,
            epoch,
            state: Mutex::new(PendingState {
                pending: 1,
                failed: false,
                abandoned: false,
            }),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    pub fn pending(&self) -> usize {
        self.state().pending
    }

    pub fn has_failed(&self) -> bool {
        self.state().failed
    }

    pub fn is_abandoned(&self) -> bool {
        self.state().abandoned
    }

    fn state(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register one more expected acknowledgement.
    pub fn add_expected(&self) {
        self.state().pending += 1;
    }

    fn mark_failed(&self) {
        self.state().failed = true;
    }

    /// Decrement, returning `Some(failed)` when the counter reached zero.
    fn release_one(&self) -> Option<bool> {
        let mut state = self.state();
        if state.pending == 0 {
            return None;
        }
        state.pending -= 1;
        (state.pending == 0).then_some(state.failed)
    }

    fn read_epoch<'a>(&self, tracker: &'a InFlightTracker) -> Option<RwLockReadGuard<'a, Epochs>> {
        tracker.epoch().read_if_current(&self.partition, self.epoch)
    }

    /// Drop the dispatch bias once every handler has been invoked and its
    /// retries resolved.
    pub fn release_bias(&self, tracker: &InFlightTracker) {
        let settled = match self.read_epoch(tracker) {
            Some(_guard) => self
                .release_one()
                .map(|failed| tracker.settle_async(&self.message, failed))
                .is_some(),
            None => {
                debug!(
                    topic = %self.message.topic,
                    partition = self.message.partition,
                    offset = self.message.offset,
                    "Dispatch finished after revocation, ignoring"
                );
                false
            }
        };
        if settled {
            tracker.resume_if_below_ceiling();
        }
    }

    /// Settle the message as failed right away, whatever is still pending.
    /// Used when dispatch itself broke down and the outstanding
    /// acknowledgements can no longer be accounted for: the message is never
    /// committed but its bytes are released.
    pub fn abandon(&self, tracker: &InFlightTracker) {
        let settled = {
            let Some(_guard) = self.read_epoch(tracker) else {
                return;
            };
            let mut state = self.state();
            if state.pending == 0 {
                false
            } else {
                state.pending = 0;
                state.failed = true;
                state.abandoned = true;
                drop(state);
                tracker.settle_async(&self.message, true);
                true
            }
        };
        if settled {
            tracker.resume_if_below_ceiling();
        }
    }
}

/// Single-use acknowledgement handed to a handler in asynchronous commit mode.
///
/// Cloning shares the one-shot flag: retries of the same entry receive clones
/// of one acknowledgement, and only the first call across all clones counts.
#[derive(Clone)]
pub struct Acknowledgement {
    entry: RegistrationId,
    used: Arc<AtomicBool>,
    pending: Arc<PendingAcks>,
    tracker: Arc<InFlightTracker>,
}

impl Acknowledgement {
    pub fn new(entry: RegistrationId, pending: Arc<PendingAcks>, tracker: Arc<InFlightTracker>) -> Self {
        Self {
            entry,
            used: Arc::new(AtomicBool::new(false)),
            pending,
            tracker,
        }
    }

    pub fn entry(&self) -> RegistrationId {
        self.entry
    }

    pub fn epoch(&self) -> u64 {
        self.pending.epoch()
    }

    /// Acknowledge the message. Returns false, with no effect, when the
    /// partition was revoked since the message was admitted, when the message
    /// was abandoned or when this acknowledgement was already used.
    pub fn ack(&self) -> bool {
        let message = self.pending.message();
        let settled = {
            let Some(_guard) = self.pending.read_epoch(&self.tracker) else {
                debug!(
                    entry_id = %self.entry,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Rejecting acknowledgement from a revoked epoch"
                );
                metrics::counter!(ACKS_REJECTED, "reason" => "stale_epoch").increment(1);
                return false;
            };

            if self.pending.is_abandoned() {
                debug!(
                    entry_id = %self.entry,
                    offset = message.offset,
                    "Rejecting acknowledgement of an abandoned message"
                );
                metrics::counter!(ACKS_REJECTED, "reason" => "abandoned").increment(1);
                return false;
            }

            if self.used.swap(true, Ordering::SeqCst) {
                warn!(
                    entry_id = %self.entry,
                    offset = message.offset,
                    "Message already acknowledged by this callback"
                );
                metrics::counter!(ACKS_REJECTED, "reason" => "duplicate").increment(1);
                return false;
            }

            self.pending
                .release_one()
                .map(|failed| self.tracker.settle_async(message, failed))
                .is_some()
        };

        if settled {
            self.tracker.resume_if_below_ceiling();
        }
        true
    }

    /// Called when the entry exhausted its retries: the message must never be
    /// committed, and the entry's expected acknowledgement is rolled back
    /// unless the handler already used it.
    pub(crate) fn fail(&self) {
        let message = self.pending.message();
        let settled = {
            let Some(_guard) = self.pending.read_epoch(&self.tracker) else {
                return;
            };

            self.pending.mark_failed();
            if self.used.swap(true, Ordering::SeqCst) {
                false
            } else {
                self.pending
                    .release_one()
                    .map(|failed| self.tracker.settle_async(message, failed))
                    .is_some()
            }
        };

        if settled {
            self.tracker.resume_if_below_ceiling();
        }
    }
}

impl fmt::Debug for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledgement")
            .field("entry", &self.entry)
            .field("epoch", &self.pending.epoch())
            .field("used", &self.used.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_message, test_tracker};

    #[test]
    fn test_revoke_only_invalidates_revoked_partitions() {
        let guard = EpochGuard::new();
        let revoked = Partition::new("t", 0);
        let kept = Partition::new("t", 1);
        assert_eq!(guard.current(), 0);

        drop(guard.revoke(&[revoked.clone()]));
        assert_eq!(guard.current(), 1);
        assert!(guard.read_if_current(&revoked, 0).is_none());
        assert!(guard.read_if_current(&revoked, 1).is_some());
        assert!(guard.read_if_current(&kept, 0).is_some());

        drop(guard.revoke(&[kept.clone()]));
        assert!(guard.read_if_current(&kept, 1).is_none());
        assert!(guard.read_if_current(&revoked, 1).is_some());
    }

    #[test]
    fn test_reset_invalidates_every_partition() {
        let guard = EpochGuard::new();
        drop(guard.revoke(&[Partition::new("t", 0)]));
        drop(guard.reset());

        assert_eq!(guard.current(), 2);
        assert!(guard.read_if_current(&Partition::new("t", 1), 1).is_none());
        assert!(guard.read_if_current(&Partition::new("t", 0), 2).is_some());
    }

    #[test]
    fn test_bias_keeps_counter_positive_during_dispatch() {
        let (tracker, _) = test_tracker(1024, false);
        let message = Arc::new(test_message("t", 0, 5));
        let epoch = tracker.admit(&message);

        let pending = Arc::new(PendingAcks::new(message.clone(), epoch));
        pending.add_expected();
        let ack = Acknowledgement::new(RegistrationId::new(), pending.clone(), tracker.clone());

        // acknowledged before dispatch finished issuing calls
        assert!(ack.ack());
        assert_eq!(pending.pending(), 1);
        assert_eq!(tracker.offsets().get_partition_offset(&message.partition_key()), None);

        pending.release_bias(&tracker);
        assert_eq!(pending.pending(), 0);
        assert_eq!(tracker.offsets().get_partition_offset(&message.partition_key()), Some(5));
        assert_eq!(tracker.gate().queued_bytes(), 0);
    }

    #[test]
    fn test_second_ack_is_rejected() {
        let (tracker, _) = test_tracker(1024, false);
        let message = Arc::new(test_message("t", 0, 5));
        let epoch = tracker.admit(&message);

        let pending = Arc::new(PendingAcks::new(message, epoch));
        pending.add_expected();
        pending.add_expected();
        let ack = Acknowledgement::new(RegistrationId::new(), pending.clone(), tracker.clone());
        let retry_clone = ack.clone();

        assert!(ack.ack());
        assert!(!ack.ack());
        assert!(!retry_clone.ack());
        assert_eq!(pending.pending(), 2);
    }

    #[test]
    fn test_stale_ack_is_rejected_without_effect() {
        let (tracker, _) = test_tracker(1024, false);
        let message = Arc::new(test_message("t", 0, 5));
        let epoch = tracker.admit(&message);

        let pending = Arc::new(PendingAcks::new(message.clone(), epoch));
        pending.add_expected();
        let ack = Acknowledgement::new(RegistrationId::new(), pending.clone(), tracker.clone());

        tracker.revoke(&[message.partition_key()]);

        assert!(!ack.ack());
        assert_eq!(pending.pending(), 2);
        assert_eq!(tracker.offsets().partition_count(), 0);
    }

    #[test]
    fn test_failed_entry_blocks_commit_but_releases_bytes() {
        let (tracker, _) = test_tracker(1024, false);
        let message = Arc::new(test_message("t", 0, 5));
        let epoch = tracker.admit(&message);

        let pending = Arc::new(PendingAcks::new(message.clone(), epoch));
        pending.add_expected();
        pending.add_expected();
        let failing = Acknowledgement::new(RegistrationId::new(), pending.clone(), tracker.clone());
        let succeeding = Acknowledgement::new(RegistrationId::new(), pending.clone(), tracker.clone());

        failing.fail();
        assert!(succeeding.ack());
        pending.release_bias(&tracker);

        assert!(pending.has_failed());
        assert_eq!(pending.pending(), 0);
        assert_eq!(tracker.offsets().get_partition_offset(&message.partition_key()), None);
        assert_eq!(tracker.gate().queued_bytes(), 0);
        // the failed entry cannot acknowledge afterwards
        assert!(!failing.ack());
    }

    #[test]
    fn test_ack_on_kept_partition_survives_other_revocation() {
        let (tracker, _) = test_tracker(1024, false);
        let message = Arc::new(test_message("t", 1, 5));
        let epoch = tracker.admit(&message);

        let pending = Arc::new(PendingAcks::new(message.clone(), epoch));
        pending.add_expected();
        let ack = Acknowledgement::new(RegistrationId::new(), pending.clone(), tracker.clone());

        tracker.revoke(&[Partition::new("t", 0)]);

        assert!(ack.ack());
        pending.release_bias(&tracker);
        assert_eq!(tracker.offsets().get_partition_offset(&message.partition_key()), Some(5));
        assert_eq!(tracker.gate().queued_bytes(), 0);
    }

    #[test]
    fn test_abandon_releases_bytes_without_commit() {
        let (tracker, _) = test_tracker(1024, false);
        let message = Arc::new(test_message("t", 0, 5));
        let epoch = tracker.admit(&message);

        let pending = Arc::new(PendingAcks::new(message.clone(), epoch));
        pending.add_expected();
        let ack = Acknowledgement::new(RegistrationId::new(), pending.clone(), tracker.clone());

        // dispatch broke down before the bias was released
        pending.abandon(&tracker);

        assert!(pending.is_abandoned());
        assert_eq!(pending.pending(), 0);
        assert_eq!(tracker.gate().queued_bytes(), 0);
        assert_eq!(tracker.offsets().get_partition_offset(&message.partition_key()), None);

        assert!(!ack.ack());
        pending.abandon(&tracker);
        assert_eq!(tracker.gate().queued_bytes(), 0);
    }
}
