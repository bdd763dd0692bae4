use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::epoch::Acknowledgement;
use crate::types::Message;

/// Application code processing messages of the topics it was registered for.
///
/// Returning an error (or panicking) counts as a failed attempt; the consumer
/// retries up to the configured number of times. With asynchronous commit
/// enabled every invocation receives an [`Acknowledgement`] that must be
/// called once the message is durably handled, possibly long after `handle`
/// returned. Retries of the same message share one acknowledgement.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Arc<Message>, ack: Option<Acknowledgement>) -> Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Arc<Message>, Option<Acknowledgement>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Arc<Message>, ack: Option<Acknowledgement>) -> Result<()> {
        (self.f)(message, ack).await
    }
}

/// ```ignore
/// consumer.register_callback(
///     TopicMatcher::exact("orders"),
///     handler_fn(|message, _ack| async move {
///         tracing::info!(offset = message.offset, "got order");
///         Ok(())
///     }),
/// );
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<Message>, Option<Acknowledgement>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(HandlerFn { f })
}
