use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backpressure::BackpressureGate;
use crate::commit::CommitCoordinator;
use crate::config::{Config, ConsumerOptions};
use crate::dispatcher::Dispatcher;
use crate::epoch::PendingAcks;
use crate::error::{BrokerError, ConsumerError};
use crate::events::{ConsumerEvent, EventBus, EventKind};
use crate::handler::MessageHandler;
use crate::kafka::{BrokerClient, KafkaBrokerClient, RebalanceHandler};
use crate::metrics_consts::{MESSAGES_RECEIVED, PROCESSING_FAILURES, WORK_ITEMS_DISCARDED};
use crate::registry::{RegistrationId, TopicMatcher, TopicRegistry};
use crate::subscription::SubscriptionRefresher;
use crate::tracker::{Completion, InFlightTracker};
use crate::types::{ConsumerStatus, Message, Partition};

/// A received message waiting for a worker, tagged with the epoch it was
/// admitted under.
struct WorkItem {
    message: Arc<Message>,
    epoch: u64,
}

/// Background tasks of an initialized consumer
struct Running {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Consumes messages from Kafka and hands them to the callbacks registered
/// for their topic, committing offsets only once processing is safe.
///
/// Cloning is cheap and yields a handle to the same consumer.
#[derive(Clone)]
pub struct CallbackConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    options: ConsumerOptions,
    broker: Arc<dyn BrokerClient>,
    registry: Arc<TopicRegistry>,
    events: Arc<EventBus>,
    tracker: Arc<InFlightTracker>,
    dispatcher: Dispatcher,
    refresher: Arc<SubscriptionRefresher>,
    ready: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl CallbackConsumer {
    pub fn new(options: ConsumerOptions, broker: Arc<dyn BrokerClient>) -> Self {
        info!(?options, "Creating callback consumer");

        let registry = Arc::new(TopicRegistry::new());
        let events = Arc::new(EventBus::new());
        let gate = BackpressureGate::new(options.max_queued_bytes(), broker.clone(), events.clone());
        let tracker = Arc::new(InFlightTracker::new(
            gate,
            options.commit_on_processing_failure(),
        ));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            events.clone(),
            options.max_callback_retries(),
        );
        let refresher = Arc::new(SubscriptionRefresher::new(
            registry.clone(),
            broker.clone(),
            options.subscription_backoff(),
        ));

        Self {
            inner: Arc::new(ConsumerInner {
                options,
                broker,
                registry,
                events,
                tracker,
                dispatcher,
                refresher,
                ready: AtomicBool::new(false),
                running: Mutex::new(None),
            }),
        }
    }

    /// Build a consumer talking to Kafka through rdkafka.
    pub fn from_config(config: &Config) -> Result<Self, ConsumerError> {
        let options = config.to_consumer_options()?;
        let broker = KafkaBrokerClient::new(&config.to_client_config(), options.status_timeout())?;
        Ok(Self::new(options, Arc::new(broker)))
    }

    /// Connect and start consuming. Fails if the broker is unreachable, in
    /// which case an `ErrorConnecting` event is emitted as well.
    pub async fn init(&self) -> Result<(), ConsumerError> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Err(ConsumerError::AlreadyInitialized);
        }

        info!("Connecting the consumer");
        let rebalance_handler: Arc<dyn RebalanceHandler> = self.inner.clone();
        if let Err(e) = self.inner.broker.connect(rebalance_handler).await {
            error!("Failed to connect the consumer: {}", e);
            self.inner.events.emit(ConsumerEvent::ErrorConnecting);
            return Err(ConsumerError::Connecting(e));
        }

        let shutdown = CancellationToken::new();
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let commit = CommitCoordinator::new(self.inner.broker.clone(), self.inner.tracker.clone());

        let tasks = vec![
            tokio::spawn(self.inner.clone().receive_loop(work_tx, shutdown.clone())),
            tokio::spawn(self.inner.clone().worker_loop(work_rx, shutdown.clone())),
            tokio::spawn(commit.run(self.inner.options.commit_interval(), shutdown.clone())),
        ];
        *running = Some(Running { shutdown, tasks });

        self.inner.ready.store(true, Ordering::SeqCst);
        self.inner.refresher.set_ready();
        info!("Consumer is ready");
        self.inner.events.emit(ConsumerEvent::Ready);
        Ok(())
    }

    /// Register a handler for an exact topic or a topic pattern.
    pub fn register_callback(
        &self,
        matcher: TopicMatcher,
        handler: Arc<dyn MessageHandler>,
    ) -> RegistrationId {
        let (id, change) = self.inner.registry.register(matcher, handler);
        if change.refresh_needed {
            self.inner.refresher.request_refresh();
        }
        id
    }

    pub fn register_topic(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> RegistrationId {
        self.register_callback(TopicMatcher::exact(topic), handler)
    }

    pub fn register_pattern(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<RegistrationId, ConsumerError> {
        Ok(self.register_callback(TopicMatcher::pattern(pattern)?, handler))
    }

    /// Remove a registration. Unknown ids are ignored.
    pub fn unregister_callback(&self, id: RegistrationId) {
        if self.inner.registry.unregister(id).refresh_needed {
            self.inner.refresher.request_refresh();
        }
    }

    /// Listen for consumer events. Listeners of one kind run in registration
    /// order and must not block.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&ConsumerEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener);
    }

    pub async fn status(&self) -> ConsumerStatus {
        self.inner
            .broker
            .status(self.inner.options.status_timeout())
            .await
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.tracker.gate().is_paused()
    }

    /// Bytes admitted and not yet released
    pub fn queued_bytes(&self) -> u64 {
        self.inner.tracker.gate().queued_bytes()
    }

    pub fn assignment(&self) -> Vec<Partition> {
        self.inner.tracker.assignment()
    }

    /// Unsubscribe, stop consuming, commit what is safe and disconnect.
    ///
    /// Resolves immediately if the consumer was never initialized. Fails with
    /// [`ConsumerError::DisconnectTimeout`] if this takes longer than the
    /// configured disconnect timeout.
    pub async fn finish(&self) -> Result<(), ConsumerError> {
        let mut running = self.inner.running.lock().await;
        let Some(current) = running.take() else {
            debug!("Consumer is not ready, nothing to finish");
            return Ok(());
        };

        info!("Finishing the consumer");
        self.inner.ready.store(false, Ordering::SeqCst);

        let timeout = self.inner.options.disconnect_timeout();
        match tokio::time::timeout(timeout, self.inner.shutdown(current)).await {
            Ok(result) => {
                self.inner.reset();
                info!("Consumer disconnected");
                self.inner.events.emit(ConsumerEvent::Disconnected);
                result.map_err(ConsumerError::Broker)
            }
            Err(_) => {
                error!("Disconnection timeout after {:?}", timeout);
                // Tasks are stopped; registrations must not reach the broker anymore
                self.inner.refresher.reset();
                Err(ConsumerError::DisconnectTimeout(timeout))
            }
        }
    }
}

impl ConsumerInner {
    async fn receive_loop(
        self: Arc<Self>,
        work_tx: mpsc::UnboundedSender<WorkItem>,
        shutdown: CancellationToken,
    ) {
        info!("Starting message consumption");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    break;
                }

                result = self.broker.recv() => {
                    match result {
                        Ok(message) => {
                            metrics::counter!(MESSAGES_RECEIVED).increment(1);
                            debug!(
                                topic = %message.topic,
                                partition = message.partition,
                                offset = message.offset,
                                size = message.size,
                                "Received message"
                            );
                            let message = Arc::new(message);
                            let epoch = self.tracker.admit(&message);
                            if work_tx.send(WorkItem { message, epoch }).is_err() {
                                warn!("Work queue closed, stopping message consumption");
                                break;
                            }
                        }
                        Err(BrokerError::Closed) => {
                            info!("Broker client closed, stopping message consumption");
                            break;
                        }
                        Err(e) => {
                            error!("Error receiving message: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        info!("Message consumption stopped");
    }

    /// Hands queued work to at most `max_concurrent_processing` concurrent
    /// tasks, in delivery order.
    async fn worker_loop(
        self: Arc<Self>,
        mut work_rx: mpsc::UnboundedReceiver<WorkItem>,
        shutdown: CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_processing()));
        let resume_on_drain = !self.options.async_commit();

        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => break,
                item = work_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Revoked while queued
            if !self
                .tracker
                .is_current(&item.message.partition_key(), item.epoch)
            {
                debug!(
                    topic = %item.message.topic,
                    partition = item.message.partition,
                    offset = item.message.offset,
                    "Discarding queued message of a revoked assignment"
                );
                metrics::counter!(WORK_ITEMS_DISCARDED).increment(1);
                self.tracker.work_item_done(resume_on_drain);
                continue;
            }

            let inner = self.clone();
            tokio::spawn(async move {
                inner.process(item).await;
                drop(permit);
            });
        }

        debug!("Worker loop stopped");
    }

    async fn process(self: &Arc<Self>, item: WorkItem) {
        let WorkItem { message, epoch } = item;
        let async_commit = self.options.async_commit();

        let pending = async_commit.then(|| Arc::new(PendingAcks::new(message.clone(), epoch)));

        let outcome = if let Some(pending) = &pending {
            AssertUnwindSafe(self.dispatcher.dispatch_with_acks(pending, &self.tracker))
                .catch_unwind()
                .await
        } else {
            AssertUnwindSafe(self.dispatcher.dispatch(message.clone()))
                .catch_unwind()
                .await
        };

        let succeeded = match outcome {
            Ok(outcome) => outcome.succeeded(),
            Err(_) => {
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Internal error during processing message"
                );
                metrics::counter!(PROCESSING_FAILURES, "source" => "internal").increment(1);
                // The acknowledgements can no longer settle the message
                if let Some(pending) = &pending {
                    pending.abandon(&self.tracker);
                }
                self.events.emit(ConsumerEvent::ErrorProcessing {
                    entry: None,
                    message: message.clone(),
                });
                false
            }
        };

        if !async_commit
            && self.tracker.complete_sync(&message, epoch, succeeded) == Completion::Unrecoverable
        {
            error!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Consumer cannot keep working properly. Finishing consumer."
            );
            let consumer = CallbackConsumer {
                inner: self.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = consumer.finish().await {
                    error!("Failed to finish the consumer: {}", e);
                }
            });
        }

        self.tracker.work_item_done(!async_commit);
    }

    async fn shutdown(&self, running: Running) -> Result<(), BrokerError> {
        if let Err(e) = self.broker.unsubscribe() {
            warn!("Failed to unsubscribe: {}", e);
        }

        running.shutdown.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!("Consumer task ended abnormally: {}", e);
            }
        }

        let commit = CommitCoordinator::new(self.broker.clone(), self.tracker.clone());
        match commit.commit_pending() {
            Ok(offsets) => info!(partitions = offsets.len(), "Final offsets committed"),
            Err(e) => error!("Failed to commit final offsets: {}", e),
        }

        self.broker.disconnect().await
    }

    /// Back to the state of a freshly created consumer
    fn reset(&self) {
        self.registry.clear();
        self.refresher.reset();
        self.tracker.reset();
        self.ready.store(false, Ordering::SeqCst);
    }
}

impl RebalanceHandler for ConsumerInner {
    fn on_partitions_assigned(&self, partitions: &[Partition]) {
        self.tracker.on_assigned(partitions);
    }

    fn on_partitions_revoked(&self, partitions: &[Partition]) {
        self.tracker.revoke(partitions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::test_utils::{test_message, MockBroker};
    use std::sync::atomic::AtomicUsize;

    fn consumer(options: ConsumerOptions) -> (CallbackConsumer, Arc<MockBroker>) {
        let broker = Arc::new(MockBroker::new());
        (CallbackConsumer::new(options, broker.clone()), broker)
    }

    #[tokio::test]
    async fn test_init_twice_fails() {
        let (consumer, _) = consumer(ConsumerOptions::default());

        consumer.init().await.unwrap();
        assert!(matches!(
            consumer.init().await,
            Err(ConsumerError::AlreadyInitialized)
        ));
        consumer.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_emits_event() {
        let (consumer, broker) = consumer(ConsumerOptions::default());
        broker.fail_connect(true);
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        consumer.on(EventKind::ErrorConnecting, move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        let result = consumer.init().await;

        assert!(matches!(result, Err(ConsumerError::Connecting(_))));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!consumer.is_ready());
    }

    #[tokio::test]
    async fn test_registration_before_init_subscribes_on_ready() {
        let (consumer, broker) = consumer(ConsumerOptions::default());
        consumer.register_topic("t", handler_fn(|_, _| async { Ok(()) }));
        assert!(broker.subscribe_calls().is_empty());

        consumer.init().await.unwrap();
        assert_eq!(broker.subscribe_calls(), vec![vec!["t".to_string()]]);
        consumer.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_rejected() {
        let (consumer, _) = consumer(ConsumerOptions::default());
        let result = consumer.register_pattern("(unclosed", handler_fn(|_, _| async { Ok(()) }));
        assert!(matches!(result, Err(ConsumerError::InvalidPattern(_))));
    }

    #[tokio::test]
    async fn test_finish_when_not_ready_resolves_immediately() {
        let (consumer, broker) = consumer(ConsumerOptions::default());
        consumer.finish().await.unwrap();
        assert_eq!(broker.disconnect_count(), 0);
    }

    #[tokio::test]
    async fn test_status_reflects_connection() {
        let (consumer, _) = consumer(ConsumerOptions::default());
        assert!(!consumer.status().await.connected);

        consumer.init().await.unwrap();
        let status = consumer.status().await;
        assert!(status.connected);
        assert_eq!(status.metadata.unwrap().brokers.len(), 1);

        consumer.finish().await.unwrap();
        assert!(!consumer.status().await.connected);
    }

    #[tokio::test]
    async fn test_rebalance_updates_assignment() {
        let (consumer, broker) = consumer(ConsumerOptions::default());
        consumer.init().await.unwrap();

        broker.assign(&[Partition::new("t", 0), Partition::new("t", 1)]);
        assert_eq!(consumer.assignment().len(), 2);

        broker.revoke(&[Partition::new("t", 0)]);
        assert_eq!(consumer.assignment(), vec![Partition::new("t", 1)]);

        consumer.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_message_is_processed() {
        let (consumer, broker) = consumer(ConsumerOptions::default());
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        consumer.register_topic(
            "t",
            handler_fn(move |message, _| {
                let done_tx = done_tx.clone();
                async move {
                    done_tx.send(message.offset).unwrap();
                    Ok(())
                }
            }),
        );
        consumer.init().await.unwrap();

        broker.send(test_message("t", 0, 7));

        assert_eq!(done_rx.recv().await, Some(7));
        consumer.finish().await.unwrap();
    }
}
