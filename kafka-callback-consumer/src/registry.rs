//! Topic Registry - maps topics and topic patterns to registered handlers.
//!
//! Exact topics keep their handlers in registration order; pattern entries
//! are kept in a separate collection and every pattern matching a message's
//! topic is invoked. A registration id lives in exactly one of the two.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use regex::Regex;
use tracing::debug;
use uuid::Uuid;

use crate::handler::MessageHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(Uuid);

impl RegistrationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RegistrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub enum TopicMatcher {
    Exact(String),
    Pattern(Regex),
}

impl TopicMatcher {
    pub fn exact(topic: impl Into<String>) -> Self {
        TopicMatcher::Exact(topic.into())
    }

    pub fn pattern(expression: &str) -> Result<Self, regex::Error> {
        Ok(TopicMatcher::Pattern(Regex::new(expression)?))
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicMatcher::Exact(exact) => exact == topic,
            TopicMatcher::Pattern(regex) => regex.is_match(topic),
        }
    }

    /// The string handed to the broker subscription. librdkafka treats topics
    /// starting with `^` as regular expressions; unanchored patterns get a
    /// `^.*` prefix so they keep matching anywhere in the topic name.
    pub fn subscription_topic(&self) -> String {
        match self {
            TopicMatcher::Exact(exact) => exact.clone(),
            TopicMatcher::Pattern(regex) if regex.as_str().starts_with('^') => {
                regex.as_str().to_string()
            }
            TopicMatcher::Pattern(regex) => format!("^.*{}", regex.as_str()),
        }
    }
}

impl fmt::Display for TopicMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicMatcher::Exact(exact) => write!(f, "{exact}"),
            TopicMatcher::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

pub struct CallbackEntry {
    id: RegistrationId,
    matcher: TopicMatcher,
    handler: Arc<dyn MessageHandler>,
}

impl CallbackEntry {
    pub fn new(matcher: TopicMatcher, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            id: RegistrationId::new(),
            matcher,
            handler,
        }
    }

    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn matcher(&self) -> &TopicMatcher {
        &self.matcher
    }

    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }
}

impl fmt::Debug for CallbackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackEntry")
            .field("id", &self.id)
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryInner {
    exact: HashMap<String, Vec<Arc<CallbackEntry>>>,
    patterns: Vec<Arc<CallbackEntry>>,
}

/// Outcome of a registry mutation: whether the broker subscription set
/// changed and needs refreshing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub refresh_needed: bool,
}

#[derive(Default)]
pub struct TopicRegistry {
    inner: RwLock<RegistryInner>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `matcher`. Adding a handler to an exact topic
    /// that already has one leaves the subscription set unchanged.
    pub fn register(
        &self,
        matcher: TopicMatcher,
        handler: Arc<dyn MessageHandler>,
    ) -> (RegistrationId, SubscriptionChange) {
        let entry = Arc::new(CallbackEntry::new(matcher, handler));
        let id = entry.id();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let refresh_needed = match entry.matcher() {
            TopicMatcher::Pattern(_) => {
                inner.patterns.push(entry.clone());
                true
            }
            TopicMatcher::Exact(topic) => {
                let entries = inner.exact.entry(topic.clone()).or_default();
                entries.push(entry.clone());
                entries.len() == 1
            }
        };

        debug!(entry_id = %id, matcher = %entry.matcher(), refresh_needed, "Registered callback");
        (id, SubscriptionChange { refresh_needed })
    }

    /// Remove a registration. Unknown ids are ignored.
    pub fn unregister(&self, id: RegistrationId) -> SubscriptionChange {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let patterns_before = inner.patterns.len();
        inner.patterns.retain(|entry| entry.id() != id);
        if inner.patterns.len() != patterns_before {
            debug!(entry_id = %id, "Unregistered pattern callback");
            return SubscriptionChange {
                refresh_needed: true,
            };
        }

        let mut emptied = None;
        for (topic, entries) in inner.exact.iter_mut() {
            let before = entries.len();
            entries.retain(|entry| entry.id() != id);
            if entries.len() != before {
                if entries.is_empty() {
                    emptied = Some(topic.clone());
                }
                debug!(entry_id = %id, topic = %topic, "Unregistered callback");
                break;
            }
        }

        match emptied {
            Some(topic) => {
                inner.exact.remove(&topic);
                SubscriptionChange {
                    refresh_needed: true,
                }
            }
            None => SubscriptionChange {
                refresh_needed: false,
            },
        }
    }

    /// Every entry interested in `topic`: matching patterns first, then the
    /// exact-topic entries in registration order.
    pub fn matching(&self, topic: &str) -> Vec<Arc<CallbackEntry>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        let mut entries: Vec<Arc<CallbackEntry>> = inner
            .patterns
            .iter()
            .filter(|entry| entry.matcher().matches(topic))
            .cloned()
            .collect();

        if let Some(exact) = inner.exact.get(topic) {
            entries.extend(exact.iter().cloned());
        }
        entries
    }

    /// Exact topics with at least one entry (sorted) followed by every
    /// pattern, in broker subscription form.
    pub fn subscription_topics(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        let mut topics: Vec<String> = inner.exact.keys().cloned().collect();
        topics.sort();
        topics.extend(
            inner
                .patterns
                .iter()
                .map(|entry| entry.matcher().subscription_topic()),
        );
        topics
    }

    pub fn entry_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.patterns.len() + inner.exact.values().map(Vec::len).sum::<usize>()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.exact.clear();
        inner.patterns.clear();
    }
}
