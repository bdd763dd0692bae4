use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::error::ConfigError;
use crate::kafka::ConsumerConfigBuilder;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "kafka-callback-consumer")]
    pub kafka_consumer_group: String,

    // Only used by the binary, library users register their own topics
    #[envconfig(default = "consumer.testing")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Pattern subscriptions only see new topics after a metadata refresh
    #[envconfig(default = "30000")]
    pub kafka_topic_metadata_refresh_interval_ms: u32,

    // Processing configuration
    #[envconfig(default = "1")]
    pub max_concurrent_processing: usize,

    #[envconfig(default = "false")]
    pub async_commit_enabled: bool,

    #[envconfig(default = "0")]
    pub max_callback_retries: u32,

    #[envconfig(default = "true")]
    pub commit_on_processing_failure: bool,

    #[envconfig(default = "10485760")] // 10MB
    pub max_queued_bytes: u64,

    // Subscription refresh backoff
    #[envconfig(default = "1000")]
    pub subscription_backoff_min_ms: u64,

    #[envconfig(default = "60000")]
    pub subscription_backoff_max_ms: u64,

    #[envconfig(default = "1000")]
    pub subscription_backoff_delta_ms: u64,

    #[envconfig(default = "5000")]
    pub commit_interval_ms: u64,

    #[envconfig(default = "3000")]
    pub disconnect_timeout_ms: u64,

    #[envconfig(default = "3000")]
    pub status_timeout_ms: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Validate the processing options and freeze them
    pub fn to_consumer_options(&self) -> Result<ConsumerOptions, ConfigError> {
        ConsumerOptions::builder()
            .with_max_concurrent_processing(self.max_concurrent_processing)
            .with_async_commit(self.async_commit_enabled)
            .with_max_callback_retries(self.max_callback_retries)
            .with_commit_on_processing_failure(self.commit_on_processing_failure)
            .with_max_queued_bytes(self.max_queued_bytes)
            .with_subscription_backoff(
                Duration::from_millis(self.subscription_backoff_min_ms),
                Duration::from_millis(self.subscription_backoff_max_ms),
                Duration::from_millis(self.subscription_backoff_delta_ms),
            )
            .with_commit_interval(Duration::from_millis(self.commit_interval_ms))
            .with_disconnect_timeout(Duration::from_millis(self.disconnect_timeout_ms))
            .with_status_timeout(Duration::from_millis(self.status_timeout_ms))
            .build()
    }

    /// Build the rdkafka client configuration. Offset commits are always
    /// managed by the consumer, never by librdkafka.
    pub fn to_client_config(&self) -> ClientConfig {
        ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_tls(self.kafka_tls)
            .with_topic_metadata_refresh_interval_ms(self.kafka_topic_metadata_refresh_interval_ms)
            .build()
    }
}

/// Truncated exponential backoff with a random delta, used between
/// subscription attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionBackoff {
    pub min: Duration,
    pub max: Duration,
    pub delta: Duration,
}

impl SubscriptionBackoff {
    /// `min(max, min * 2^retries + delta * jitter)` where `jitter` is in `[0, 1)`.
    pub fn delay(&self, retries: u32, jitter: f64) -> Duration {
        let exponential = self.min.as_secs_f64() * 2f64.powi(retries.min(63) as i32);
        let randomized = exponential + self.delta.as_secs_f64() * jitter.clamp(0.0, 1.0);
        let capped = randomized.min(self.max.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    pub fn delay_with_random_jitter(&self, retries: u32) -> Duration {
        self.delay(retries, rand::random::<f64>())
    }
}

impl Default for SubscriptionBackoff {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(1000),
            max: Duration::from_millis(60000),
            delta: Duration::from_millis(1000),
        }
    }
}

/// Immutable processing options, fixed for the lifetime of a consumer.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    max_concurrent_processing: usize,
    async_commit: bool,
    max_callback_retries: u32,
    commit_on_processing_failure: bool,
    max_queued_bytes: u64,
    subscription_backoff: SubscriptionBackoff,
    commit_interval: Duration,
    disconnect_timeout: Duration,
    status_timeout: Duration,
}

impl ConsumerOptions {
    pub fn builder() -> ConsumerOptionsBuilder {
        ConsumerOptionsBuilder::default()
    }

    pub fn max_concurrent_processing(&self) -> usize {
        self.max_concurrent_processing
    }

    pub fn async_commit(&self) -> bool {
        self.async_commit
    }

    pub fn max_callback_retries(&self) -> u32 {
        self.max_callback_retries
    }

    pub fn commit_on_processing_failure(&self) -> bool {
        self.commit_on_processing_failure
    }

    pub fn max_queued_bytes(&self) -> u64 {
        self.max_queued_bytes
    }

    pub fn subscription_backoff(&self) -> SubscriptionBackoff {
        self.subscription_backoff
    }

    pub fn commit_interval(&self) -> Duration {
        self.commit_interval
    }

    pub fn disconnect_timeout(&self) -> Duration {
        self.disconnect_timeout
    }

    pub fn status_timeout(&self) -> Duration {
        self.status_timeout
    }
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_processing: 1,
            async_commit: false,
            max_callback_retries: 0,
            commit_on_processing_failure: true,
            max_queued_bytes: 10 * 1024 * 1024,
            subscription_backoff: SubscriptionBackoff::default(),
            commit_interval: Duration::from_millis(5000),
            disconnect_timeout: Duration::from_millis(3000),
            status_timeout: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsumerOptionsBuilder {
    options: ConsumerOptions,
}

impl ConsumerOptionsBuilder {
    /// Maximum number of messages being processed simultaneously. Handlers are
    /// invoked in delivery order but may complete in any order.
    pub fn with_max_concurrent_processing(mut self, max: usize) -> Self {
        self.options.max_concurrent_processing = max;
        self
    }

    /// When enabled, a message is finished only once every matching handler
    /// has called its acknowledgement.
    pub fn with_async_commit(mut self, enabled: bool) -> Self {
        self.options.async_commit = enabled;
        self
    }

    /// Additional attempts after a handler fails. Zero means a single attempt.
    pub fn with_max_callback_retries(mut self, retries: u32) -> Self {
        self.options.max_callback_retries = retries;
        self
    }

    pub fn with_commit_on_processing_failure(mut self, enabled: bool) -> Self {
        self.options.commit_on_processing_failure = enabled;
        self
    }

    pub fn with_max_queued_bytes(mut self, bytes: u64) -> Self {
        self.options.max_queued_bytes = bytes;
        self
    }

    pub fn with_subscription_backoff(mut self, min: Duration, max: Duration, delta: Duration) -> Self {
        self.options.subscription_backoff = SubscriptionBackoff { min, max, delta };
        self
    }

    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.options.commit_interval = interval;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.options.disconnect_timeout = timeout;
        self
    }

    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.options.status_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ConsumerOptions, ConfigError> {
        let options = self.options;

        if options.max_concurrent_processing == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_concurrent_processing",
            });
        }
        if options.max_queued_bytes == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_queued_bytes",
            });
        }
        if options.commit_interval.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "commit_interval",
            });
        }
        if options.disconnect_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "disconnect_timeout",
            });
        }
        let backoff = options.subscription_backoff;
        if backoff.min > backoff.max {
            return Err(ConfigError::BackoffRange {
                min_ms: backoff.min.as_millis() as u64,
                max_ms: backoff.max.as_millis() as u64,
            });
        }

        Ok(options)
    }
}
