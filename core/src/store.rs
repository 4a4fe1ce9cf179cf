//! Store trait seams for the outbox and dead-letter tables.
//!
//! # Design
//!
//! The stores are the only shared mutable state in the subsystem. Correctness
//! under multiple dispatcher replicas rests entirely on the claim step's
//! lock-skip semantics inside the store, never on in-memory coordination, so
//! these traits expose short, self-contained transactional operations.
//!
//! # Implementations
//!
//! - `PostgresOutboxStore` / `PostgresDeadLetterStore` (in
//!   `relaybox-postgres`): production implementation
//! - `InMemoryOutboxStore` / `InMemoryDeadLetterStore` (in
//!   `relaybox-testing`): fast, deterministic testing

use crate::event::{ClaimedEvent, DeadLetterEntry, ReclaimOutcome};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database connectivity or statement failure.
    #[error("database error: {0}")]
    Database(String),

    /// Row data could not be converted to or from its domain representation.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable queue of pending domain events.
///
/// Rows are written atomically with the originating state mutation (the
/// writer-side `append` lives on the concrete store, since it must execute
/// inside the caller's transaction). A row is visible to dispatch exactly
/// while `published_at IS NULL`.
pub trait OutboxStore: Send + Sync {
    /// Claim up to `max` unpublished rows, oldest sequence id first.
    ///
    /// Rows locked by a concurrent claim are skipped, not waited on, so
    /// replicas never double-claim. The claimed-at stamp and the selection
    /// commit together in one short transaction; broker I/O never happens
    /// while row locks are held.
    fn claim_batch(
        &self,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ClaimedEvent>, StoreError>> + Send + '_>>;

    /// Set `published_at` for the given claimed rows.
    ///
    /// Executed per tenant, each group in its own transaction with that
    /// tenant's isolation context applied first. After this call the
    /// dispatcher is done with these rows for good, whether they reached the
    /// broker or the dead-letter table.
    fn mark_published<'a>(
        &'a self,
        events: &'a [ClaimedEvent],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;
}

/// Durable quarantine of events that failed to publish.
pub trait DeadLetterStore: Send + Sync {
    /// Record a failed event with the supplied human-readable reason.
    ///
    /// Carries the full routing metadata forward so the entry can later be
    /// reconstructed into a fresh outbox row without re-deriving context.
    fn record<'a>(
        &'a self,
        event: &'a ClaimedEvent,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    /// Select up to `max` entries eligible for reclaim, oldest first.
    ///
    /// Eligible means not quarantined and past (or without) `next_retry_at`.
    fn eligible_batch(
        &self,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterEntry>, StoreError>> + Send + '_>>;

    /// Run one reclaim attempt for an entry, inside a single tenant-scoped
    /// transaction.
    ///
    /// - `retry_count >= max_retries`: quarantine with reason
    ///   "retry limit reached". Terminal; quarantined entries are never
    ///   auto-deleted or mutated again.
    /// - otherwise, re-insert the entry as a fresh outbox row and delete it.
    /// - if the insert fails (e.g. missing routing metadata), increment the
    ///   retry count, stamp the attempt, and schedule the next attempt after
    ///   `retry_delay`.
    fn reclaim<'a>(
        &'a self,
        entry: &'a DeadLetterEntry,
        max_retries: i32,
        retry_delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ReclaimOutcome, StoreError>> + Send + 'a>>;

    /// Count of non-quarantined entries, for the backlog gauge.
    fn backlog(&self)
    -> Pin<Box<dyn Future<Output = Result<i64, StoreError>> + Send + '_>>;
}
