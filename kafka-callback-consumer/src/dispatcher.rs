use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::epoch::{Acknowledgement, PendingAcks};
use crate::events::{ConsumerEvent, EventBus};
use crate::metrics_consts::{CALLBACK_RETRIES, PROCESSING_FAILURES};
use crate::registry::{CallbackEntry, TopicRegistry};
use crate::tracker::InFlightTracker;
use crate::types::Message;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Number of registry entries the message was delivered to
    pub matched: usize,
    /// Entries that exhausted their retries
    pub failed: usize,
}

impl DispatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Fans a message out to every interested registry entry.
///
/// Entries run concurrently and independently; a failing entry is retried up
/// to `max_retries` more times without delay and never affects the others.
pub struct Dispatcher {
    registry: Arc<TopicRegistry>,
    events: Arc<EventBus>,
    max_retries: u32,
}

impl Dispatcher {
    pub fn new(registry: Arc<TopicRegistry>, events: Arc<EventBus>, max_retries: u32) -> Self {
        Self {
            registry,
            events,
            max_retries,
        }
    }

    /// Dispatch for synchronous commit: resolves once every entry succeeded
    /// or exhausted its retries.
    pub async fn dispatch(&self, message: Arc<Message>) -> DispatchOutcome {
        let entries = self.registry.matching(&message.topic);
        if entries.is_empty() {
            debug!(topic = %message.topic, offset = message.offset, "No callbacks for topic, skipping");
            return DispatchOutcome::default();
        }

        let results = join_all(
            entries
                .iter()
                .map(|entry| self.invoke_with_retries(entry, &message, None)),
        )
        .await;

        DispatchOutcome {
            matched: entries.len(),
            failed: results.iter().filter(|succeeded| !**succeeded).count(),
        }
    }

    /// Dispatch for asynchronous commit. Each entry gets its own single-use
    /// acknowledgement counted in `pending`; the message settles once all of
    /// them were called and this dispatch returned.
    pub async fn dispatch_with_acks(
        &self,
        pending: &Arc<PendingAcks>,
        tracker: &Arc<InFlightTracker>,
    ) -> DispatchOutcome {
        let message = pending.message().clone();
        let entries = self.registry.matching(&message.topic);
        if entries.is_empty() {
            debug!(topic = %message.topic, offset = message.offset, "No callbacks for topic, skipping");
        }

        let calls: Vec<_> = entries
            .iter()
            .map(|entry| {
                pending.add_expected();
                let ack = Acknowledgement::new(entry.id(), pending.clone(), tracker.clone());
                let message = message.clone();
                async move {
                    let succeeded = self
                        .invoke_with_retries(entry, &message, Some(ack.clone()))
                        .await;
                    if !succeeded {
                        ack.fail();
                    }
                    succeeded
                }
            })
            .collect();

        let results = join_all(calls).await;
        pending.release_bias(tracker);

        DispatchOutcome {
            matched: entries.len(),
            failed: results.iter().filter(|succeeded| !**succeeded).count(),
        }
    }

    async fn invoke_with_retries(
        &self,
        entry: &CallbackEntry,
        message: &Arc<Message>,
        ack: Option<Acknowledgement>,
    ) -> bool {
        let attempts = self.max_retries.saturating_add(1);

        for attempt in 1..=attempts {
            debug!(
                topic = %message.topic,
                offset = message.offset,
                entry_id = %entry.id(),
                attempt,
                attempts,
                "Calling callback"
            );

            let result = AssertUnwindSafe(entry.handler().handle(message.clone(), ack.clone()))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => warn!(
                    topic = %message.topic,
                    entry_id = %entry.id(),
                    attempt,
                    "Error on callback: {:#}",
                    e
                ),
                Err(_) => warn!(
                    topic = %message.topic,
                    entry_id = %entry.id(),
                    attempt,
                    "Callback panicked"
                ),
            }

            if attempt < attempts {
                metrics::counter!(CALLBACK_RETRIES).increment(1);
            }
        }

        error!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            entry_id = %entry.id(),
            "Callback failed in all {} attempts",
            attempts
        );
        metrics::counter!(PROCESSING_FAILURES, "source" => "callback").increment(1);
        self.events.emit(ConsumerEvent::ErrorProcessing {
            entry: Some(entry.id()),
            message: message.clone(),
        });
        false
    }
}
