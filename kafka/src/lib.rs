//! Kafka message publisher for Relaybox.
//!
//! Implements the [`MessagePublisher`] trait from `relaybox-core` on top of
//! rdkafka. Works against any Kafka-compatible broker (Apache Kafka,
//! Redpanda, AWS MSK, ...).
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: the dispatcher only marks outbox rows published after
//!   every record in the batch is acknowledged; a crash in between causes
//!   redelivery, so consumers must deduplicate on event id.
//! - **All-or-nothing per topic batch**: any record failure fails the whole
//!   `publish` call; the dispatcher never observes partial success.
//! - **Ordering within a key**: records are sent in slice order, and same-key
//!   records map to the same partition, so per-aggregate order is preserved.
//!
//! # Example
//!
//! ```no_run
//! use relaybox_kafka::KafkaPublisher;
//! use relaybox_core::publisher::{KeyedMessage, MessagePublisher};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let publisher = KafkaPublisher::builder()
//!     .brokers("localhost:9092")
//!     .acks("all")
//!     .compression("snappy")
//!     .build()?;
//!
//! publisher
//!     .publish(
//!         "activity_events",
//!         vec![KeyedMessage { key: "t-1:a-9".to_string(), value: vec![0, 0, 0, 0, 42] }],
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use relaybox_core::publisher::{KeyedMessage, MessagePublisher, PublishError};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Kafka publisher backed by an rdkafka `FutureProducer`.
pub struct KafkaPublisher {
    producer: FutureProducer,
    /// Broker addresses, kept for diagnostics.
    brokers: String,
    /// Per-record delivery timeout.
    timeout: Duration,
}

impl KafkaPublisher {
    /// Create a publisher with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::ConnectionFailed`] if the producer cannot be
    /// created from the given broker list.
    pub fn new(brokers: &str) -> Result<Self, PublishError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the publisher.
    #[must_use]
    pub fn builder() -> KafkaPublisherBuilder {
        KafkaPublisherBuilder::default()
    }

    /// Broker addresses this publisher was built with.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Per-record delivery timeout this publisher was built with.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn producer_config(brokers: &str, acks: &str, compression: &str, timeout: Duration) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", timeout.as_millis().to_string())
        .set("acks", acks)
        .set("compression.type", compression);
    config
}

/// Builder for configuring a [`KafkaPublisher`].
#[derive(Default)]
pub struct KafkaPublisherBuilder {
    brokers: Option<String>,
    acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl KafkaPublisherBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all" (the outbox guarantees depend on durable acks).
    #[must_use]
    pub fn acks(mut self, acks: impl Into<String>) -> Self {
        self.acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "snappy"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the per-record delivery timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the [`KafkaPublisher`].
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::ConnectionFailed`] if brokers are not set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<KafkaPublisher, PublishError> {
        let brokers = self
            .brokers
            .ok_or_else(|| PublishError::ConnectionFailed("Brokers not configured".to_string()))?;

        let acks = self.acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("snappy");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = producer_config(&brokers, acks, compression, timeout)
            .create()
            .map_err(|e| {
                PublishError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        tracing::info!(
            brokers = %brokers,
            acks = acks,
            compression = compression,
            timeout = ?timeout,
            "KafkaPublisher created"
        );

        Ok(KafkaPublisher {
            producer,
            brokers,
            timeout,
        })
    }
}

impl MessagePublisher for KafkaPublisher {
    fn publish(
        &self,
        topic: &str,
        messages: Vec<KeyedMessage>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        let topic = topic.to_string();
        let timeout = self.timeout;

        Box::pin(async move {
            // Records are sent in slice order; same-key records land on the
            // same partition, so per-key order survives the broker hop.
            for message in &messages {
                let record = FutureRecord::to(&topic)
                    .payload(&message.value)
                    .key(&message.key);

                match self.producer.send(record, Timeout::After(timeout)).await {
                    Ok((partition, offset)) => {
                        tracing::trace!(
                            topic = %topic,
                            partition = partition,
                            offset = offset,
                            key = %message.key,
                            "Record delivered"
                        );
                    }
                    Err((kafka_error, _)) => {
                        tracing::error!(
                            topic = %topic,
                            key = %message.key,
                            error = %kafka_error,
                            "Failed to deliver record, failing topic batch"
                        );
                        return Err(PublishError::PublishFailed {
                            topic,
                            reason: kafka_error.to_string(),
                        });
                    }
                }
            }

            tracing::debug!(topic = %topic, records = messages.len(), "Topic batch published");
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn kafka_publisher_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KafkaPublisher>();
        assert_sync::<KafkaPublisher>();
    }

    #[test]
    fn builder_requires_brokers() {
        let result = KafkaPublisher::builder().build();
        assert!(matches!(result, Err(PublishError::ConnectionFailed(_))));
    }

    #[test]
    fn builder_default_works() {
        let _builder = KafkaPublisher::builder();
    }

    #[test]
    fn builder_timeout_drives_delivery_config() {
        let config = producer_config("localhost:9092", "all", "snappy", Duration::from_secs(30));
        assert_eq!(config.get("message.timeout.ms"), Some("30000"));

        let publisher = KafkaPublisher::builder()
            .brokers("localhost:9092")
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        assert_eq!(publisher.timeout(), Duration::from_secs(30));
    }
}
