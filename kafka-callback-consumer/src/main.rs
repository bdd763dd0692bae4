use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kafka_callback_consumer::config::Config;
use kafka_callback_consumer::events::{ConsumerEvent, EventKind};
use kafka_callback_consumer::handler::handler_fn;
use kafka_callback_consumer::CallbackConsumer;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("Starting Kafka callback consumer");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    info!("Configuration loaded: {:?}", config);

    let consumer = CallbackConsumer::from_config(&config)
        .context("Failed to create the consumer. Check your Kafka configuration.")?;

    consumer.on(EventKind::Paused, |_| info!("Received paused event"));
    consumer.on(EventKind::Resumed, |_| info!("Received resumed event"));
    consumer.on(EventKind::ErrorProcessing, |event| {
        if let ConsumerEvent::ErrorProcessing { entry, message } = event {
            warn!(
                entry_id = ?entry,
                topic = %message.topic,
                offset = message.offset,
                "Message could not be processed"
            );
        }
    });

    let async_commit = config.async_commit_enabled;
    consumer.register_topic(
        &config.kafka_consumer_topic,
        handler_fn(move |message, ack| async move {
            let value = message
                .value
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            info!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Received message: {}",
                value
            );
            if async_commit {
                if let Some(ack) = ack {
                    ack.ack();
                }
            }
            Ok(())
        }),
    );

    consumer
        .init()
        .await
        .context("Failed to connect to Kafka")?;

    let status_consumer = consumer.clone();
    let status_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
        loop {
            ticker.tick().await;
            let status = status_consumer.status().await;
            match serde_json::to_string(&status) {
                Ok(status) => info!("Consumer status: {}", status),
                Err(e) => warn!("Failed to serialize consumer status: {}", e),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("Shutdown signal received, finishing consumer");

    status_task.abort();
    consumer.finish().await?;

    info!("Consumer finished");
    Ok(())
}
