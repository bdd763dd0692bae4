use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backpressure::BackpressureGate;
use crate::error::BrokerError;
use crate::events::EventBus;
use crate::kafka::{BrokerClient, RebalanceHandler};
use crate::tracker::InFlightTracker;
use crate::types::{BrokerInfo, ClusterMetadata, ConsumerStatus, Message, Partition};

/// Build a message with a small fixed payload
pub fn test_message(topic: &str, partition: i32, offset: i64) -> Message {
    Message::new(topic, partition, offset, b"test-payload".to_vec())
}

/// Tracker wired to a fresh [`MockBroker`]
pub fn test_tracker(
    max_queued_bytes: u64,
    commit_on_failure: bool,
) -> (Arc<InFlightTracker>, Arc<MockBroker>) {
    let broker = Arc::new(MockBroker::new());
    let gate = BackpressureGate::new(max_queued_bytes, broker.clone(), Arc::new(EventBus::new()));
    (
        Arc::new(InFlightTracker::new(gate, commit_on_failure)),
        broker,
    )
}

#[derive(Default)]
struct MockState {
    assignment: Vec<Partition>,
    connected: bool,
    /// Disconnected and not connected again; `recv` fails with `Closed`
    closed: bool,
    fail_connect: bool,
    hang_disconnect: bool,
    disconnect_count: usize,
    subscribe_attempts: usize,
    subscribe_failures: usize,
    subscribe_calls: Vec<Vec<String>>,
    unsubscribe_count: usize,
    pause_calls: Vec<Vec<Partition>>,
    resume_calls: Vec<Vec<Partition>>,
    fail_commit: bool,
    commit_calls: Vec<HashMap<Partition, i64>>,
}

/// In-memory [`BrokerClient`] recording every call it receives.
///
/// Messages are injected with [`MockBroker::send`]; rebalances with
/// [`MockBroker::assign`] and [`MockBroker::revoke`], which call the installed
/// rebalance handler synchronously like librdkafka does. Like the rdkafka
/// client, a disconnected mock refuses to receive until connected again.
pub struct MockBroker {
    state: Mutex<MockState>,
    rebalance_handler: Mutex<Option<Arc<dyn RebalanceHandler>>>,
    sender: mpsc::UnboundedSender<Message>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(MockState::default()),
            rebalance_handler: Mutex::new(None),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> Option<Arc<dyn RebalanceHandler>> {
        self.rebalance_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn send(&self, message: Message) {
        // the receiver lives as long as self
        if self.sender.send(message).is_err() {
            tracing::warn!("Mock broker receiver dropped");
        }
    }

    pub fn set_assignment(&self, partitions: Vec<Partition>) {
        self.state().assignment = partitions;
    }

    pub fn assign(&self, partitions: &[Partition]) {
        {
            let mut state = self.state();
            for partition in partitions {
                if !state.assignment.contains(partition) {
                    state.assignment.push(partition.clone());
                }
            }
        }
        if let Some(handler) = self.handler() {
            handler.on_partitions_assigned(partitions);
        }
    }

    pub fn revoke(&self, partitions: &[Partition]) {
        if let Some(handler) = self.handler() {
            handler.on_partitions_revoked(partitions);
        }
        self.state()
            .assignment
            .retain(|partition| !partitions.contains(partition));
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    /// Make the next `count` subscribe calls fail
    pub fn fail_subscribe(&self, count: usize) {
        self.state().subscribe_failures = count;
    }

    pub fn fail_commit(&self, fail: bool) {
        self.state().fail_commit = fail;
    }

    /// Make disconnect never complete
    pub fn hang_disconnect(&self, hang: bool) {
        self.state().hang_disconnect = hang;
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnect_count
    }

    /// Successful subscriptions, in order
    pub fn subscribe_calls(&self) -> Vec<Vec<String>> {
        self.state().subscribe_calls.clone()
    }

    pub fn subscribe_attempts(&self) -> usize {
        self.state().subscribe_attempts
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.state().unsubscribe_count
    }

    pub fn pause_calls(&self) -> Vec<Vec<Partition>> {
        self.state().pause_calls.clone()
    }

    pub fn resume_calls(&self) -> Vec<Vec<Partition>> {
        self.state().resume_calls.clone()
    }

    pub fn commit_calls(&self) -> Vec<HashMap<Partition, i64>> {
        self.state().commit_calls.clone()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn connect(&self, rebalance_handler: Arc<dyn RebalanceHandler>) -> Result<(), BrokerError> {
        let mut state = self.state();
        if state.fail_connect {
            return Err(BrokerError::Request("broker unreachable".to_string()));
        }
        state.connected = true;
        state.closed = false;
        *self
            .rebalance_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(rebalance_handler);
        Ok(())
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.subscribe_attempts += 1;
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(BrokerError::Request("subscribe failed".to_string()));
        }
        state.subscribe_calls.push(topics.to_vec());
        Ok(())
    }

    fn unsubscribe(&self) -> Result<(), BrokerError> {
        self.state().unsubscribe_count += 1;
        Ok(())
    }

    async fn recv(&self) -> Result<Message, BrokerError> {
        if self.state().closed {
            return Err(BrokerError::Closed);
        }
        self.receiver
            .lock()
            .await
            .recv()
            .await
            .ok_or(BrokerError::Closed)
    }

    fn pause(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.state().pause_calls.push(partitions.to_vec());
        Ok(())
    }

    fn resume(&self, partitions: &[Partition]) -> Result<(), BrokerError> {
        self.state().resume_calls.push(partitions.to_vec());
        Ok(())
    }

    fn assignment(&self) -> Result<Vec<Partition>, BrokerError> {
        Ok(self.state().assignment.clone())
    }

    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), BrokerError> {
        let mut state = self.state();
        if state.fail_commit {
            return Err(BrokerError::Request("commit failed".to_string()));
        }
        state.commit_calls.push(offsets.clone());
        Ok(())
    }

    async fn status(&self, _timeout: Duration) -> ConsumerStatus {
        if !self.state().connected {
            return ConsumerStatus::disconnected();
        }
        ConsumerStatus::connected(ClusterMetadata {
            brokers: vec![BrokerInfo {
                id: 0,
                host: "mock".to_string(),
                port: 9092,
            }],
            topics: Vec::new(),
        })
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        let hang = {
            let mut state = self.state();
            state.disconnect_count += 1;
            state.hang_disconnect
        };
        if hang {
            std::future::pending::<()>().await;
        }
        let mut state = self.state();
        state.connected = false;
        state.closed = true;
        Ok(())
    }
}
