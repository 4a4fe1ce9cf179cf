//! The outbox dispatch loop: claim, frame, publish, finalize.

use crate::config::DispatchConfig;
use relaybox_core::catalog::EventCatalog;
use relaybox_core::event::ClaimedEvent;
use relaybox_core::publisher::{KeyedMessage, MessagePublisher, PublishError};
use relaybox_core::registry::{RegistryError, SchemaRegistrar};
use relaybox_core::store::{DeadLetterStore, OutboxStore, StoreError};
use relaybox_core::wire;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{RwLock, watch};

/// Why a claimed batch could not be delivered.
///
/// Any of these fails the whole batch: every claimed row is dead-lettered
/// with this error's rendering (plus the row's topic) as the reason, and the
/// rows are still finalized so they never block the queue head.
#[derive(Error, Debug)]
enum DeliveryError {
    #[error("no schema metadata for event_type={0}")]
    UnknownEventType(String),

    #[error("schema registry returned invalid id {0}")]
    InvalidSchemaId(i32),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Polls the outbox and relays claimed rows to the broker.
///
/// Safe to run as multiple replicas: claims never overlap because the store
/// skips locked rows, and every claimed row is finalized by the cycle that
/// claimed it (published or dead-lettered). A cycle that dies before
/// finalizing leaves its rows unpublished, so a later cycle re-claims them;
/// consumers must tolerate at-least-once delivery.
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn MessagePublisher>,
    registrar: Arc<dyn SchemaRegistrar>,
    dead_letters: Arc<dyn DeadLetterStore>,
    catalog: EventCatalog,
    config: DispatchConfig,
    /// Process-local `"{subject}::{schema}"` → id cache. Subjects are
    /// append-only per event type, so entries are never invalidated.
    schema_ids: RwLock<HashMap<String, i32>>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Create a dispatcher and the sender that shuts it down.
    ///
    /// Send `true` on the returned channel for a graceful stop: the current
    /// cycle finishes, then [`run`](Self::run) returns.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn MessagePublisher>,
        registrar: Arc<dyn SchemaRegistrar>,
        dead_letters: Arc<dyn DeadLetterStore>,
        catalog: EventCatalog,
        config: DispatchConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Self {
            store,
            publisher,
            registrar,
            dead_letters,
            catalog,
            config,
            schema_ids: RwLock::new(HashMap::new()),
            shutdown: shutdown_rx,
        };
        (dispatcher, shutdown_tx)
    }

    /// Run the dispatch loop until shutdown is signalled.
    ///
    /// Cycle errors are logged and the loop keeps going: a transient store
    /// failure must not kill the relay, the next tick simply retries.
    pub async fn run(mut self) {
        tracing::info!(
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            "Starting outbox dispatcher"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(0) => {}
                        Ok(count) => {
                            tracing::debug!(events = count, "Dispatch cycle finalized events");
                        }
                        Err(error) => {
                            metrics::counter!("outbox_dispatch_cycle_errors_total").increment(1);
                            tracing::error!(%error, "Dispatch cycle failed");
                        }
                    }
                }
                changed = self.shutdown.changed() => {
                    // A dropped sender counts as shutdown; otherwise changed()
                    // resolves with an error on every iteration and the
                    // select would spin hot.
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Outbox dispatcher stopped");
    }

    /// Run one dispatch cycle; returns the number of rows finalized.
    ///
    /// Claims up to the configured batch size, attempts delivery, and
    /// finalizes every claimed row. On delivery failure the whole batch is
    /// dead-lettered, each row carrying the failure reason and its topic,
    /// and the rows are still marked published so the queue never wedges on
    /// a poison row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if claiming, dead-lettering, or finalizing
    /// fails; the rows then stay unpublished and a later cycle re-claims
    /// them.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let started = Instant::now();
        let batch = self.store.claim_batch(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        match self.deliver(&batch).await {
            Ok(()) => {
                metrics::counter!("outbox_events_published_total").increment(batch.len() as u64);
            }
            Err(error) => {
                tracing::warn!(%error, events = batch.len(), "Batch delivery failed, dead-lettering");
                metrics::counter!("outbox_events_failed_total").increment(batch.len() as u64);
                for event in &batch {
                    let reason = format!("{error} (topic={})", event.topic);
                    self.dead_letters.record(event, &reason).await?;
                    metrics::counter!(
                        "outbox_events_dead_lettered_total",
                        "topic" => event.topic.clone()
                    )
                    .increment(1);
                }
            }
        }

        // Finalize after the delivery attempt settles, success or not. Rows
        // routed to the dead-letter table are owned by the reclaimer now.
        self.store.mark_published(&batch).await?;
        metrics::histogram!("outbox_dispatch_cycle_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(batch.len())
    }

    /// Frame the batch and push it to the broker, one call per topic.
    ///
    /// Batch order is claim order (ascending sequence id), so messages for
    /// the same key within a topic batch keep their relative order.
    async fn deliver(&self, batch: &[ClaimedEvent]) -> Result<(), DeliveryError> {
        let mut per_topic: HashMap<&str, Vec<KeyedMessage>> = HashMap::new();

        for event in batch {
            let meta = self
                .catalog
                .lookup(&event.event_type)
                .ok_or_else(|| DeliveryError::UnknownEventType(event.event_type.clone()))?;
            let schema_id = self.schema_id(meta.schema_subject, meta.schema).await?;
            let payload = serde_json::to_vec(&event.payload)?;
            per_topic
                .entry(event.topic.as_str())
                .or_default()
                .push(KeyedMessage {
                    key: event.partition_key.clone(),
                    value: wire::encode(schema_id, &payload),
                });
        }

        for (topic, messages) in per_topic {
            self.publisher.publish(topic, messages).await?;
        }
        Ok(())
    }

    /// Resolve a schema id, hitting the registry at most once per
    /// `(subject, schema)` pair for the process lifetime.
    async fn schema_id(&self, subject: &str, schema: &str) -> Result<u32, DeliveryError> {
        let key = format!("{subject}::{schema}");
        if let Some(id) = self.schema_ids.read().await.get(&key) {
            return u32::try_from(*id).map_err(|_| DeliveryError::InvalidSchemaId(*id));
        }

        let id = self.registrar.ensure_schema(subject, schema).await?;
        let wire_id = u32::try_from(id).map_err(|_| DeliveryError::InvalidSchemaId(id))?;
        self.schema_ids.write().await.insert(key, id);
        Ok(wire_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use relaybox_core::event::EventType;
    use relaybox_testing::{
        InMemoryDeadLetterStore, InMemoryOutboxStore, RecordingPublisher, StaticRegistrar,
    };
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        store: Arc<InMemoryOutboxStore>,
        publisher: Arc<RecordingPublisher>,
        registrar: Arc<StaticRegistrar>,
        dead_letters: Arc<InMemoryDeadLetterStore>,
        dispatcher: Dispatcher,
        shutdown: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let store = InMemoryOutboxStore::new();
        let publisher = RecordingPublisher::new();
        let registrar = StaticRegistrar::new(7);
        let dead_letters = InMemoryDeadLetterStore::new();
        let (dispatcher, shutdown) = Dispatcher::new(
            store.clone(),
            publisher.clone(),
            registrar.clone(),
            dead_letters.clone(),
            EventCatalog::builtin(),
            DispatchConfig::default(),
        );
        Harness {
            store,
            publisher,
            registrar,
            dead_letters,
            dispatcher,
            shutdown,
        }
    }

    async fn append_created(store: &InMemoryOutboxStore, tenant: &str, aggregate: &str) {
        let event = EventCatalog::builtin()
            .outbox_event(
                EventType::ActivityCreated,
                tenant,
                "activity",
                aggregate,
                json!({"activity_id": aggregate, "tenant_id": tenant}),
            )
            .unwrap();
        assert!(store.append(&event).await);
    }

    fn raw_event(event_type: &str, key: &str, payload: serde_json::Value) -> ClaimedEvent {
        ClaimedEvent {
            event_id: 0,
            tenant_id: "t-1".to_string(),
            aggregate_type: "activity".to_string(),
            aggregate_id: key.to_string(),
            event_type: event_type.to_string(),
            topic: "activity_events".to_string(),
            schema_subject: "activity_events-value".to_string(),
            partition_key: key.to_string(),
            payload,
        }
    }

    #[tokio::test]
    async fn publishes_framed_batch_and_finalizes_rows() {
        let h = harness();
        append_created(&h.store, "t-1", "a-1").await;
        append_created(&h.store, "t-1", "a-2").await;

        let count = h.dispatcher.run_once().await.unwrap();
        assert_eq!(count, 2);

        let batches = h.publisher.batches().await;
        assert_eq!(batches.len(), 1);
        let (topic, messages) = &batches[0];
        assert_eq!(topic, "activity_events");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].key, "t-1:a-1");
        assert_eq!(messages[1].key, "t-1:a-2");

        let (schema_id, payload) = wire::decode(&messages[0].value).unwrap();
        assert_eq!(schema_id, 7);
        let decoded: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(decoded["activity_id"], "a-1");

        assert_eq!(h.store.published_ids().await.len(), 2);
        assert_eq!(h.store.pending_count().await, 0);
        assert!(h.dead_letters.entries().await.is_empty());
    }

    #[tokio::test]
    async fn schema_id_is_cached_across_cycles() {
        let h = harness();
        append_created(&h.store, "t-1", "a-1").await;
        h.dispatcher.run_once().await.unwrap();

        append_created(&h.store, "t-1", "a-2").await;
        h.dispatcher.run_once().await.unwrap();

        assert_eq!(h.registrar.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_event_type_dead_letters_and_finalizes() {
        let h = harness();
        let id = h
            .store
            .seed(raw_event("unknown.type", "a-1", json!({"k": 1})))
            .await;

        h.dispatcher.run_once().await.unwrap();

        assert!(h.publisher.batches().await.is_empty());
        let entries = h.dead_letters.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].reason,
            "no schema metadata for event_type=unknown.type (topic=activity_events)"
        );
        assert_eq!(entries[0].event_id, Some(id));
        assert_eq!(h.store.published_ids().await, vec![id]);
    }

    #[tokio::test]
    async fn broker_failure_dead_letters_whole_batch() {
        let h = harness();
        append_created(&h.store, "t-1", "a-1").await;
        append_created(&h.store, "t-2", "a-2").await;
        h.publisher.fail_with(Some("broker unavailable")).await;

        h.dispatcher.run_once().await.unwrap();

        let entries = h.dead_letters.entries().await;
        assert_eq!(entries.len(), 2);
        for entry in &entries {
            assert!(entry.reason.contains("broker unavailable"), "{}", entry.reason);
            assert!(entry.reason.ends_with("(topic=activity_events)"), "{}", entry.reason);
        }
        // Rows are finalized even when the broker is down: they now live in
        // the dead-letter table, not the outbox.
        assert_eq!(h.store.pending_count().await, 0);
    }

    #[tokio::test]
    async fn registry_failure_dead_letters_whole_batch() {
        let h = harness();
        append_created(&h.store, "t-1", "a-1").await;
        h.registrar.fail(true);

        h.dispatcher.run_once().await.unwrap();

        let entries = h.dead_letters.entries().await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].reason.contains("injected registry failure"));
        assert!(h.publisher.batches().await.is_empty());
    }

    #[tokio::test]
    async fn same_key_messages_keep_claim_order() {
        let h = harness();
        for state in ["pending", "synced", "failed"] {
            h.store
                .seed(raw_event(
                    "activity.created",
                    "a-1",
                    json!({"activity_id": "a-1", "state": state}),
                ))
                .await;
        }

        h.dispatcher.run_once().await.unwrap();

        let batches = h.publisher.batches().await;
        assert_eq!(batches.len(), 1);
        let states: Vec<String> = batches[0]
            .1
            .iter()
            .map(|message| {
                let (_, payload) = wire::decode(&message.value).unwrap();
                let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
                value["state"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(states, vec!["pending", "synced", "failed"]);
    }

    #[tokio::test]
    async fn empty_outbox_is_a_noop_cycle() {
        let h = harness();
        assert_eq!(h.dispatcher.run_once().await.unwrap(), 0);
        assert!(h.publisher.batches().await.is_empty());
    }

    #[tokio::test]
    async fn claim_failure_surfaces_as_cycle_error() {
        let h = harness();
        h.store.fail_claims(true);
        assert!(h.dispatcher.run_once().await.is_err());
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_loop() {
        let h = harness();
        let handle = tokio::spawn(h.dispatcher.run());
        h.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher did not stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_shutdown_sender_stops_the_loop() {
        let h = harness();
        let handle = tokio::spawn(h.dispatcher.run());
        drop(h.shutdown);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher did not stop when sender was dropped")
            .unwrap();
    }
}
