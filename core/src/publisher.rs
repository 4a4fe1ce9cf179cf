//! Message publisher trait seam.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// A framed, keyed message ready for the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedMessage {
    /// Record key; messages with the same key route to the same partition
    /// and never reorder relative to each other.
    pub key: String,
    /// Record value: wire-framed payload (see [`crate::wire`]).
    pub value: Vec<u8>,
}

/// Errors that can occur while publishing.
#[derive(Error, Debug, Clone)]
pub enum PublishError {
    /// Failed to reach or configure the broker.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to deliver a batch to a topic.
    #[error("publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed.
        topic: String,
        /// The reason for failure.
        reason: String,
    },
}

/// Delivers per-topic batches of framed messages.
///
/// One call delivers the whole batch for a topic or fails as a unit; the
/// dispatcher treats partial success as impossible by construction and routes
/// the whole originating claim-batch to the dead-letter path on any failure.
/// Relative order of same-key messages within a batch is preserved.
pub trait MessagePublisher: Send + Sync {
    /// Publish a batch of keyed messages to a topic.
    fn publish(
        &self,
        topic: &str,
        messages: Vec<KeyedMessage>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>>;
}
