use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::events::{ConsumerEvent, EventBus};
use crate::kafka::BrokerClient;
use crate::metrics_consts::{CONSUMER_PAUSED, QUEUED_BYTES};

#[derive(Default)]
struct GateState {
    queued_bytes: u64,
    paused: bool,
}

/// Backpressure Gate - bounds the bytes admitted but not yet released.
///
/// Bytes are added on admission and released on completion (synchronous mode)
/// or once every acknowledgement arrived (asynchronous mode). Crossing the
/// ceiling pauses the broker's current assignment. Pausing and resuming are
/// idempotent; the broker is only called on a state change.
pub struct BackpressureGate {
    max_queued_bytes: u64,
    state: Mutex<GateState>,
    broker: Arc<dyn BrokerClient>,
    events: Arc<EventBus>,
}

impl BackpressureGate {
    pub fn new(max_queued_bytes: u64, broker: Arc<dyn BrokerClient>, events: Arc<EventBus>) -> Self {
        Self {
            max_queued_bytes,
            state: Mutex::new(GateState::default()),
            broker,
            events,
        }
    }

    /// Account for an admitted message, pausing intake when the total
    /// exceeds the ceiling.
    pub fn admit(&self, size: u64) {
        let paused_now = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.queued_bytes = state.queued_bytes.saturating_add(size);
            metrics::gauge!(QUEUED_BYTES).set(state.queued_bytes as f64);

            debug!(
                queued_bytes = state.queued_bytes,
                max_queued_bytes = self.max_queued_bytes,
                "Current queue utilization"
            );

            if state.queued_bytes > self.max_queued_bytes && !state.paused {
                state.paused = true;
                self.pause_assignment();
                true
            } else {
                false
            }
        };

        if paused_now {
            info!("Consumer paused due to queue capacity overflow");
            metrics::gauge!(CONSUMER_PAUSED).set(1.0);
            self.events.emit(ConsumerEvent::Paused);
        }
    }

    /// Give back the bytes of a completed message. Returns the new total.
    pub fn release(&self, size: u64) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.queued_bytes = state.queued_bytes.saturating_sub(size);
        metrics::gauge!(QUEUED_BYTES).set(state.queued_bytes as f64);
        state.queued_bytes
    }

    /// Resume intake if paused.
    pub fn resume(&self) {
        let resumed_now = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.paused {
                state.paused = false;
                self.resume_assignment();
                true
            } else {
                false
            }
        };

        if resumed_now {
            info!("Consumer resumed");
            metrics::gauge!(CONSUMER_PAUSED).set(0.0);
            self.events.emit(ConsumerEvent::Resumed);
        }
    }

    /// Resume intake if the total dropped to the ceiling or below.
    pub fn resume_if_below_ceiling(&self) {
        if self.queued_bytes() <= self.max_queued_bytes {
            self.resume();
        }
    }

    /// Forget every admitted byte (revocation and shutdown).
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.queued_bytes = 0;
        metrics::gauge!(QUEUED_BYTES).set(0.0);
    }

    /// Forget the paused flag without touching the broker (shutdown).
    pub fn clear_paused(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.paused = false;
        metrics::gauge!(CONSUMER_PAUSED).set(0.0);
    }

    pub fn queued_bytes(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queued_bytes
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).paused
    }

    pub fn max_queued_bytes(&self) -> u64 {
        self.max_queued_bytes
    }

    // Broker calls happen under the state lock so pause and resume reach the
    // broker in the same order as the state changes.
    fn pause_assignment(&self) {
        let result = self
            .broker
            .assignment()
            .and_then(|assignment| self.broker.pause(&assignment));
        if let Err(e) = result {
            warn!("Failed to pause consumer assignment: {}", e);
        }
    }

    fn resume_assignment(&self) {
        let result = self
            .broker
            .assignment()
            .and_then(|assignment| self.broker.resume(&assignment));
        if let Err(e) = result {
            warn!("Failed to resume consumer assignment: {}", e);
        }
    }
}
