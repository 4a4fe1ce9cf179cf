//! In-memory test doubles for the Relaybox trait seams.
//!
//! These fakes model just enough of the store/publisher/registrar contracts
//! to exercise the dispatcher and reclaimer loops deterministically, without
//! Postgres, Kafka or a schema registry:
//!
//! - [`InMemoryOutboxStore`]: pending/claimed/published rows with claim
//!   ordering by sequence id
//! - [`InMemoryDeadLetterStore`]: retry bookkeeping, quarantine, and requeue
//!   back into a linked outbox store
//! - [`RecordingPublisher`]: captures published batches, with error injection
//! - [`StaticRegistrar`]: fixed schema ids, with call counting and error
//!   injection
//!
//! All fakes are cheaply clonable via `Arc` and safe to share across tasks.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use relaybox_core::event::{ClaimedEvent, DeadLetterEntry, NewOutboxEvent, ReclaimOutcome};
use relaybox_core::publisher::{KeyedMessage, MessagePublisher, PublishError};
use relaybox_core::registry::{RegistryError, SchemaRegistrar};
use relaybox_core::store::{DeadLetterStore, OutboxStore, StoreError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct OutboxRow {
    event: ClaimedEvent,
    dedupe_key: Option<String>,
    published_at: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
}

/// In-memory outbox store.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    rows: Mutex<Vec<OutboxRow>>,
    next_id: AtomicI64,
    fail_claims: AtomicBool,
}

impl InMemoryOutboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            fail_claims: AtomicBool::new(false),
        })
    }

    /// Append a writer-side event, honoring per-tenant dedupe keys.
    ///
    /// Returns whether a row was inserted.
    pub async fn append(&self, event: &NewOutboxEvent) -> bool {
        let mut rows = self.rows.lock().await;
        if let Some(key) = &event.dedupe_key {
            let duplicate = rows.iter().any(|row| {
                row.event.tenant_id == event.tenant_id && row.dedupe_key.as_ref() == Some(key)
            });
            if duplicate {
                return false;
            }
        }

        let event_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        rows.push(OutboxRow {
            event: ClaimedEvent {
                event_id,
                tenant_id: event.tenant_id.clone(),
                aggregate_type: event.aggregate_type.clone(),
                aggregate_id: event.aggregate_id.clone(),
                event_type: event.event_type.as_str().to_string(),
                topic: event.topic.clone(),
                schema_subject: event.schema_subject.clone(),
                partition_key: event.partition_key.clone(),
                payload: event.payload.clone(),
            },
            dedupe_key: event.dedupe_key.clone(),
            published_at: None,
            claimed_at: None,
        });
        true
    }

    /// Seed a raw row (any event type string), returning its assigned id.
    ///
    /// `template.event_id` is ignored; the store assigns the next sequence id.
    pub async fn seed(&self, template: ClaimedEvent) -> i64 {
        let event_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().await;
        rows.push(OutboxRow {
            event: ClaimedEvent { event_id, ..template },
            dedupe_key: None,
            published_at: None,
            claimed_at: None,
        });
        event_id
    }

    /// Make the next claims fail with a database error (transient-store
    /// failure injection).
    pub fn fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }

    /// Ids of rows with `published_at` set.
    pub async fn published_ids(&self) -> Vec<i64> {
        let rows = self.rows.lock().await;
        rows.iter()
            .filter(|row| row.published_at.is_some())
            .map(|row| row.event.event_id)
            .collect()
    }

    /// Number of rows still visible to dispatch.
    pub async fn pending_count(&self) -> usize {
        let rows = self.rows.lock().await;
        rows.iter().filter(|row| row.published_at.is_none()).count()
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn claim_batch(
        &self,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ClaimedEvent>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            if self.fail_claims.load(Ordering::SeqCst) {
                return Err(StoreError::Database("injected claim failure".to_string()));
            }

            let mut rows = self.rows.lock().await;
            let now = Utc::now();
            let mut claimed = Vec::new();
            for row in rows.iter_mut() {
                if claimed.len() >= max {
                    break;
                }
                if row.published_at.is_none() {
                    row.claimed_at = Some(now);
                    claimed.push(row.event.clone());
                }
            }
            claimed.sort_by_key(|event| event.event_id);
            Ok(claimed)
        })
    }

    fn mark_published<'a>(
        &'a self,
        events: &'a [ClaimedEvent],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let ids: Vec<i64> = events.iter().map(|event| event.event_id).collect();
            let mut rows = self.rows.lock().await;
            let now = Utc::now();
            for row in rows.iter_mut() {
                if ids.contains(&row.event.event_id) {
                    row.published_at = Some(now);
                }
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone)]
struct DlqRow {
    entry: DeadLetterEntry,
    next_retry_at: Option<DateTime<Utc>>,
    quarantined: Option<String>,
    created_at: DateTime<Utc>,
}

/// In-memory dead-letter store, optionally linked to an outbox store so
/// successful reclaims land back in the primary pipeline.
#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    rows: Mutex<Vec<DlqRow>>,
    next_id: AtomicI64,
    outbox: Option<Arc<InMemoryOutboxStore>>,
}

impl InMemoryDeadLetterStore {
    /// Create an unlinked store (reclaims requeue into the void).
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            outbox: None,
        })
    }

    /// Create a store whose requeues insert back into `outbox`.
    #[must_use]
    pub fn linked_to(outbox: Arc<InMemoryOutboxStore>) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            outbox: Some(outbox),
        })
    }

    /// Seed an entry directly, returning its id.
    pub async fn seed(&self, template: DeadLetterEntry) -> i64 {
        let dlq_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().await;
        rows.push(DlqRow {
            entry: DeadLetterEntry { dlq_id, ..template },
            next_retry_at: None,
            quarantined: None,
            created_at: Utc::now(),
        });
        dlq_id
    }

    /// All recorded entries (including quarantined), in creation order.
    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        let rows = self.rows.lock().await;
        rows.iter().map(|row| row.entry.clone()).collect()
    }

    /// Quarantine reason for an entry, if it was quarantined.
    pub async fn quarantine_reason(&self, dlq_id: i64) -> Option<String> {
        let rows = self.rows.lock().await;
        rows.iter()
            .find(|row| row.entry.dlq_id == dlq_id)
            .and_then(|row| row.quarantined.clone())
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn record<'a>(
        &'a self,
        event: &'a ClaimedEvent,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let dlq_id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let mut rows = self.rows.lock().await;
            rows.push(DlqRow {
                entry: DeadLetterEntry {
                    dlq_id,
                    tenant_id: event.tenant_id.clone(),
                    event_id: Some(event.event_id),
                    event_type: event.event_type.clone(),
                    topic: event.topic.clone(),
                    payload: event.payload.clone(),
                    reason: reason.to_string(),
                    aggregate_type: event.aggregate_type.clone(),
                    aggregate_id: event.aggregate_id.clone(),
                    schema_subject: event.schema_subject.clone(),
                    partition_key: event.partition_key.clone(),
                    retry_count: 0,
                },
                next_retry_at: None,
                quarantined: None,
                created_at: Utc::now(),
            });
            Ok(())
        })
    }

    fn eligible_batch(
        &self,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterEntry>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows = self.rows.lock().await;
            let now = Utc::now();
            let mut eligible: Vec<&DlqRow> = rows
                .iter()
                .filter(|row| {
                    row.quarantined.is_none()
                        && row.next_retry_at.is_none_or(|at| at <= now)
                })
                .collect();
            eligible.sort_by_key(|row| row.created_at);
            Ok(eligible
                .into_iter()
                .take(max)
                .map(|row| row.entry.clone())
                .collect())
        })
    }

    fn reclaim<'a>(
        &'a self,
        entry: &'a DeadLetterEntry,
        max_retries: i32,
        retry_delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ReclaimOutcome, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            if entry.retry_count >= max_retries {
                let mut rows = self.rows.lock().await;
                if let Some(row) = rows.iter_mut().find(|row| row.entry.dlq_id == entry.dlq_id) {
                    row.quarantined = Some("retry limit reached".to_string());
                }
                return Ok(ReclaimOutcome::Quarantined);
            }

            if entry.schema_subject.is_empty() {
                let reason = format!("missing schema_subject for dlq entry {}", entry.dlq_id);
                let mut rows = self.rows.lock().await;
                if let Some(row) = rows.iter_mut().find(|row| row.entry.dlq_id == entry.dlq_id) {
                    row.entry.retry_count += 1;
                    row.entry.reason.clone_from(&reason);
                    row.next_retry_at = Some(
                        Utc::now()
                            + chrono::Duration::from_std(retry_delay)
                                .unwrap_or_else(|_| chrono::Duration::hours(1)),
                    );
                }
                return Ok(ReclaimOutcome::Rescheduled { reason });
            }

            if let Some(outbox) = &self.outbox {
                outbox
                    .seed(ClaimedEvent {
                        event_id: 0,
                        tenant_id: entry.tenant_id.clone(),
                        aggregate_type: entry.aggregate_type.clone(),
                        aggregate_id: entry.aggregate_id.clone(),
                        event_type: entry.event_type.clone(),
                        topic: entry.topic.clone(),
                        schema_subject: entry.schema_subject.clone(),
                        partition_key: entry.partition_key.clone(),
                        payload: entry.payload.clone(),
                    })
                    .await;
            }

            let mut rows = self.rows.lock().await;
            rows.retain(|row| row.entry.dlq_id != entry.dlq_id);
            Ok(ReclaimOutcome::Requeued)
        })
    }

    fn backlog(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<i64, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows = self.rows.lock().await;
            #[allow(clippy::cast_possible_wrap)]
            Ok(rows.iter().filter(|row| row.quarantined.is_none()).count() as i64)
        })
    }
}

/// Publisher that records every batch and can be told to fail.
#[derive(Default)]
pub struct RecordingPublisher {
    batches: Mutex<Vec<(String, Vec<KeyedMessage>)>>,
    fail_with: Mutex<Option<String>>,
}

impl RecordingPublisher {
    /// Create a publisher that accepts everything.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent publishes fail with the given reason, or succeed
    /// again when `None`.
    pub async fn fail_with(&self, reason: Option<&str>) {
        *self.fail_with.lock().await = reason.map(str::to_string);
    }

    /// All recorded `(topic, batch)` pairs, in publish order.
    pub async fn batches(&self) -> Vec<(String, Vec<KeyedMessage>)> {
        self.batches.lock().await.clone()
    }
}

impl MessagePublisher for RecordingPublisher {
    fn publish(
        &self,
        topic: &str,
        messages: Vec<KeyedMessage>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            if let Some(reason) = self.fail_with.lock().await.clone() {
                return Err(PublishError::PublishFailed { topic, reason });
            }
            self.batches.lock().await.push((topic, messages));
            Ok(())
        })
    }
}

/// Registrar returning fixed ids, with call counting for cache assertions.
pub struct StaticRegistrar {
    ids: HashMap<String, i32>,
    default_id: i32,
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl StaticRegistrar {
    /// Create a registrar answering `default_id` for every subject.
    #[must_use]
    pub fn new(default_id: i32) -> Arc<Self> {
        Arc::new(Self {
            ids: HashMap::new(),
            default_id,
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }

    /// Create a registrar with per-subject ids, falling back to `default_id`.
    #[must_use]
    pub fn with_subjects(default_id: i32, ids: HashMap<String, i32>) -> Arc<Self> {
        Arc::new(Self {
            ids,
            default_id,
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }

    /// Number of `ensure_schema` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make subsequent calls fail (registry-unreachable injection).
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl SchemaRegistrar for StaticRegistrar {
    fn ensure_schema<'a>(
        &'a self,
        subject: &'a str,
        _schema: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i32, RegistryError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(RegistryError::Request(
                    "injected registry failure".to_string(),
                ));
            }
            Ok(self.ids.get(subject).copied().unwrap_or(self.default_id))
        })
    }
}
