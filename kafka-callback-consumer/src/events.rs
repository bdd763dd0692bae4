use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::registry::RegistrationId;
use crate::types::Message;

/// Notifications emitted by the consumer.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Ready,
    Disconnected,
    /// Intake stopped because the queued bytes exceeded the ceiling.
    Paused,
    Resumed,
    ErrorConnecting,
    /// A handler exhausted its retries. `entry` is `None` when the failure
    /// happened in the consumer's own bookkeeping rather than in a handler.
    ErrorProcessing {
        entry: Option<RegistrationId>,
        message: Arc<Message>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Disconnected,
    Paused,
    Resumed,
    ErrorConnecting,
    ErrorProcessing,
}

impl ConsumerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConsumerEvent::Ready => EventKind::Ready,
            ConsumerEvent::Disconnected => EventKind::Disconnected,
            ConsumerEvent::Paused => EventKind::Paused,
            ConsumerEvent::Resumed => EventKind::Resumed,
            ConsumerEvent::ErrorConnecting => EventKind::ErrorConnecting,
            ConsumerEvent::ErrorProcessing { .. } => EventKind::ErrorProcessing,
        }
    }
}

pub type EventListener = Arc<dyn Fn(&ConsumerEvent) + Send + Sync>;

/// Listener registry. Listeners of one kind run in registration order on the
/// emitting task; there is no ordering across kinds.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener. Registering the same listener twice calls it twice.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&ConsumerEvent) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn emit(&self, event: ConsumerEvent) {
        // Snapshot so listeners may register further listeners
        let listeners: Vec<EventListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for listener in listeners {
            listener(&event);
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let calls = calls.clone();
            bus.on(EventKind::Paused, move |_| calls.lock().unwrap().push(i));
        }

        bus.emit(ConsumerEvent::Paused);
        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_only_matching_kind_is_notified() {
        let bus = EventBus::new();
        let paused = Arc::new(Mutex::new(0));
        let resumed = Arc::new(Mutex::new(0));

        let p = paused.clone();
        bus.on(EventKind::Paused, move |_| *p.lock().unwrap() += 1);
        let r = resumed.clone();
        bus.on(EventKind::Resumed, move |_| *r.lock().unwrap() += 1);

        bus.emit(ConsumerEvent::Resumed);
        bus.emit(ConsumerEvent::Resumed);

        assert_eq!(*paused.lock().unwrap(), 0);
        assert_eq!(*resumed.lock().unwrap(), 2);
        assert_eq!(bus.listener_count(EventKind::Paused), 1);
        assert_eq!(bus.listener_count(EventKind::Ready), 0);
    }

    #[test]
    fn test_processing_error_carries_entry_and_message() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        bus.on(EventKind::ErrorProcessing, move |event| {
            if let ConsumerEvent::ErrorProcessing { entry, message } = event {
                *s.lock().unwrap() = Some((*entry, message.offset));
            }
        });

        let id = RegistrationId::new();
        let message = Arc::new(Message::new("t", 0, 7, b"v".to_vec()));
        bus.emit(ConsumerEvent::ErrorProcessing {
            entry: Some(id),
            message,
        });

        assert_eq!(*seen.lock().unwrap(), Some((Some(id), 7)));
    }
}
