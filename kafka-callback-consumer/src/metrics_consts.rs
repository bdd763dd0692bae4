// ==== Intake metrics ====
/// Counter for messages received from the broker
pub const MESSAGES_RECEIVED: &str = "callback_consumer_messages_received_total";

/// Gauge for bytes admitted but not yet released (queued plus unacknowledged)
pub const QUEUED_BYTES: &str = "callback_consumer_queued_bytes";

/// Gauge set to 1 while intake is paused by backpressure
pub const CONSUMER_PAUSED: &str = "callback_consumer_paused";

/// Counter for queued work items discarded because their partition was revoked
pub const WORK_ITEMS_DISCARDED: &str = "callback_consumer_work_items_discarded_total";

// ==== Processing metrics ====
/// Counter for handler attempts that failed and were retried
pub const CALLBACK_RETRIES: &str = "callback_consumer_callback_retries_total";

/// Counter for handlers that exhausted their retries
pub const PROCESSING_FAILURES: &str = "callback_consumer_processing_failures_total";

/// Counter for acknowledgements rejected (stale epoch or repeated)
pub const ACKS_REJECTED: &str = "callback_consumer_acks_rejected_total";

// ==== Commit metrics ====
/// Counter for offset commits issued, labelled by outcome
pub const OFFSET_COMMITS: &str = "callback_consumer_offset_commits_total";

/// Gauge for the last committed offset per partition
pub const PARTITION_LAST_COMMITTED_OFFSET: &str = "callback_consumer_partition_last_committed_offset";

// ==== Subscription / rebalance metrics ====
/// Counter for failed subscription attempts
pub const SUBSCRIPTION_FAILURES: &str = "callback_consumer_subscription_failures_total";

/// Counter for empty rebalances skipped (cooperative-sticky no-ops)
pub const REBALANCE_EMPTY_SKIPPED: &str = "callback_consumer_rebalance_empty_skipped_total";
