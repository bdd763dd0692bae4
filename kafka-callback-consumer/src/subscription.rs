use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::SubscriptionBackoff;
use crate::kafka::BrokerClient;
use crate::metrics_consts::SUBSCRIPTION_FAILURES;
use crate::registry::TopicRegistry;

#[derive(Default)]
struct RefreshState {
    ready: bool,
    /// A refresh is scheduled or being retried
    pending: bool,
    /// Bumped on reset so that retry tasks of a previous session stop
    generation: u64,
    runtime: Option<Handle>,
}

/// Subscription Refresher - keeps the broker subscription in line with the
/// registry.
///
/// At most one refresh is outstanding; requests made meanwhile are coalesced
/// since every attempt reads the registry afresh. Failed attempts are retried
/// with truncated exponential backoff until one succeeds. Failures are only
/// logged.
pub struct SubscriptionRefresher {
    registry: Arc<TopicRegistry>,
    broker: Arc<dyn BrokerClient>,
    backoff: SubscriptionBackoff,
    state: Mutex<RefreshState>,
}

impl SubscriptionRefresher {
    pub fn new(
        registry: Arc<TopicRegistry>,
        broker: Arc<dyn BrokerClient>,
        backoff: SubscriptionBackoff,
    ) -> Self {
        Self {
            registry,
            broker,
            backoff,
            state: Mutex::new(RefreshState::default()),
        }
    }

    /// Mark the consumer ready and refresh right away. Must be called from
    /// within a tokio runtime, which is where retries will be scheduled.
    pub fn set_ready(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.ready = true;
            state.runtime = Handle::try_current().ok();
        }
        self.request_refresh();
    }

    /// Forget readiness and any outstanding retry (disconnect).
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.ready = false;
        state.pending = false;
        state.generation += 1;
        state.runtime = None;
    }

    pub fn is_pending(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
    }

    pub fn request_refresh(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.ready {
            debug!("Consumer not ready, subscription refresh deferred");
            return;
        }
        if state.pending {
            debug!("Subscription refresh already pending");
            return;
        }

        if self.attempt() {
            return;
        }

        let Some(runtime) = state.runtime.clone() else {
            warn!("No runtime to schedule subscription retries on");
            return;
        };
        state.pending = true;
        let generation = state.generation;
        drop(state);

        let refresher = self.clone();
        runtime.spawn(async move { refresher.retry(generation).await });
    }

    async fn retry(self: Arc<Self>, generation: u64) {
        let mut retries: u32 = 0;
        loop {
            let delay = self.backoff.delay_with_random_jitter(retries);
            debug!(retries, delay_ms = delay.as_millis() as u64, "Scheduling subscription retry");
            tokio::time::sleep(delay).await;

            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.generation != generation || !state.ready {
                debug!("Consumer reset, dropping subscription retry");
                return;
            }
            if self.attempt() {
                state.pending = false;
                return;
            }
            retries = retries.saturating_add(1);
        }
    }

    /// Unsubscribe, then subscribe to the registry's current topics.
    fn attempt(&self) -> bool {
        let topics = self.registry.subscription_topics();

        let result = self.broker.unsubscribe().and_then(|()| {
            if topics.is_empty() {
                Ok(())
            } else {
                self.broker.subscribe(&topics)
            }
        });

        match result {
            Ok(()) => {
                info!(topics = ?topics, "Subscription refreshed");
                true
            }
            Err(e) => {
                warn!(topics = ?topics, "Failed to refresh subscription: {}", e);
                metrics::counter!(SUBSCRIPTION_FAILURES).increment(1);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::registry::TopicMatcher;
    use crate::test_utils::MockBroker;
    use std::time::Duration;

    fn refresher(broker: Arc<MockBroker>) -> (Arc<SubscriptionRefresher>, Arc<TopicRegistry>) {
        let registry = Arc::new(TopicRegistry::new());
        let backoff = SubscriptionBackoff {
            min: Duration::from_millis(1000),
            max: Duration::from_millis(60000),
            delta: Duration::ZERO,
        };
        (
            Arc::new(SubscriptionRefresher::new(registry.clone(), broker, backoff)),
            registry,
        )
    }

    #[tokio::test]
    async fn test_refresh_is_deferred_until_ready() {
        let broker = Arc::new(MockBroker::new());
        let (refresher, registry) = refresher(broker.clone());

        registry.register(TopicMatcher::exact("t"), handler_fn(|_, _| async { Ok(()) }));
        refresher.request_refresh();
        assert!(broker.subscribe_calls().is_empty());

        refresher.set_ready();
        assert_eq!(broker.subscribe_calls(), vec![vec!["t".to_string()]]);
        assert_eq!(broker.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_registry_only_unsubscribes() {
        let broker = Arc::new(MockBroker::new());
        let (refresher, _) = refresher(broker.clone());

        refresher.set_ready();

        assert_eq!(broker.unsubscribe_count(), 1);
        assert!(broker.subscribe_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_retries_with_backoff() {
        let broker = Arc::new(MockBroker::new());
        let (refresher, registry) = refresher(broker.clone());
        registry.register(TopicMatcher::exact("t"), handler_fn(|_, _| async { Ok(()) }));

        broker.fail_subscribe(2);
        refresher.set_ready();
        assert!(refresher.is_pending());
        assert_eq!(broker.subscribe_attempts(), 1);

        // coalesced while a retry is pending
        refresher.request_refresh();
        assert_eq!(broker.subscribe_attempts(), 1);

        // first retry after min * 2^0
        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(broker.subscribe_attempts(), 2);
        assert!(refresher.is_pending());

        // second retry after min * 2^1
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(broker.subscribe_attempts(), 2);
        tokio::time::sleep(Duration::from_millis(501)).await;
        assert_eq!(broker.subscribe_attempts(), 3);

        assert!(!refresher.is_pending());
        assert_eq!(broker.subscribe_calls(), vec![vec!["t".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_stops_retries() {
        let broker = Arc::new(MockBroker::new());
        let (refresher, registry) = refresher(broker.clone());
        registry.register(TopicMatcher::exact("t"), handler_fn(|_, _| async { Ok(()) }));

        broker.fail_subscribe(usize::MAX);
        refresher.set_ready();
        refresher.reset();
        assert!(!refresher.is_pending());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broker.subscribe_attempts(), 1);
    }
}
