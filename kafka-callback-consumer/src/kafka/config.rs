use rdkafka::ClientConfig;

/// Kafka consumer configuration builder for callback consumers.
///
/// Offsets are committed by the consumer's commit coordinator once the
/// messages before them have finished processing, so librdkafka's automatic
/// commit and offset store are always disabled. [`ConsumerConfigBuilder::set`]
/// cannot turn them back on.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

const MANAGED_KEYS: [&str; 2] = ["enable.auto.commit", "enable.auto.offset.store"];

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Override offset reset policy (earliest, latest)
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// How often librdkafka refreshes topic metadata. Pattern subscriptions
    /// only pick up newly created topics on refresh.
    pub fn with_topic_metadata_refresh_interval_ms(mut self, ms: u32) -> Self {
        self.config
            .set("topic.metadata.refresh.interval.ms", ms.to_string());
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        if MANAGED_KEYS.contains(&key) {
            tracing::warn!(key, value, "Ignoring override of consumer-managed setting");
            return self;
        }
        self.config.set(key, value);
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}
