//! Callback-driven Kafka consumer.
//!
//! Messages are fanned out to every handler registered for their topic (by
//! exact name or by pattern) and offsets are committed only once every
//! earlier message of the same partition is done. Processing is bounded by a
//! concurrency cap and a ceiling on queued bytes; partition revocation
//! discards queued work and invalidates outstanding acknowledgements.
//!
//! ## Commit modes
//!
//! - **Synchronous** (default): a message is done when every handler returned.
//!   A handler that exhausts its retries either lets the message commit anyway
//!   (`commit_on_processing_failure`) or stops the consumer.
//! - **Asynchronous**: handlers receive an [`Acknowledgement`] and the message
//!   is done once all of them acknowledged. A message with a permanently failed
//!   handler is never committed.
//!
//! ## Error logging (anyhow)
//!
//! Handler errors are `anyhow::Error` and are logged with `{e:#}` so the whole
//! cause chain ends up in the log line.

pub mod backpressure;
pub mod commit;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod epoch;
pub mod error;
pub mod events;
pub mod handler;
pub mod kafka;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod registry;
pub mod subscription;
pub mod test_utils;
pub mod tracker;
pub mod types;

// Re-export commonly used types for convenience
pub use consumer::CallbackConsumer;
pub use epoch::Acknowledgement;
pub use error::ConsumerError;
pub use events::{ConsumerEvent, EventKind};
pub use handler::{handler_fn, MessageHandler};
pub use registry::{RegistrationId, TopicMatcher};
pub use types::{Message, Partition};
