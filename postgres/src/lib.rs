//! `PostgreSQL` store implementations for Relaybox.
//!
//! Provides the production [`OutboxStore`] and
//! [`DeadLetterStore`](relaybox_core::store::DeadLetterStore) backed by sqlx.
//! All mutation happens inside row-scoped, tenant-scoped transactions; no
//! lock is held longer than a single short transaction, and broker I/O never
//! runs while one is open.
//!
//! # Tenant isolation
//!
//! Tables are protected by row-level security keyed on the
//! `app.tenant_id` session setting. Every tenant-scoped statement is preceded
//! by `SELECT set_config('app.tenant_id', $1, true)` inside its transaction.
//! The claim query is the one deliberate exception: dispatch drains a global
//! queue across tenants, and the claim touches only lifecycle timestamps.
//!
//! # Example
//!
//! ```ignore
//! use relaybox_postgres::PostgresOutboxStore;
//!
//! let store = PostgresOutboxStore::new(pool.clone());
//! let batch = store.claim_batch(25).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dead_letter;

pub use dead_letter::PostgresDeadLetterStore;

use relaybox_core::event::{ClaimedEvent, NewOutboxEvent};
use relaybox_core::store::{OutboxStore, StoreError};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

pub(crate) fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

pub(crate) async fn set_tenant_context(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
) -> Result<(), StoreError> {
    sqlx::query("SELECT set_config('app.tenant_id', $1, true)")
        .bind(tenant_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// `PostgreSQL`-backed outbox store.
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create a new outbox store with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one event inside the caller's transaction.
    ///
    /// This is the atomicity anchor of the subsystem: the caller passes the
    /// same transaction that carries its domain mutation, so either both
    /// commit or neither is ever observed downstream.
    ///
    /// When the event carries a dedupe key, a retried write is a no-op
    /// (`ON CONFLICT DO NOTHING` on the per-tenant unique index). Returns
    /// whether a row was actually inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    pub async fn append(
        tx: &mut Transaction<'_, Postgres>,
        event: &NewOutboxEvent,
    ) -> Result<bool, StoreError> {
        set_tenant_context(tx, &event.tenant_id).await?;

        let result = sqlx::query(
            r"
            INSERT INTO outbox (
                tenant_id, aggregate_type, aggregate_id, event_type,
                topic, schema_subject, partition_key, payload, dedupe_key
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, dedupe_key) DO NOTHING
            ",
        )
        .bind(&event.tenant_id)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(event.event_type.as_str())
        .bind(&event.topic)
        .bind(&event.schema_subject)
        .bind(&event.partition_key)
        .bind(&event.payload)
        .bind(&event.dedupe_key)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    fn row_to_claimed(row: &sqlx::postgres::PgRow) -> ClaimedEvent {
        ClaimedEvent {
            event_id: row.get("event_id"),
            tenant_id: row.get("tenant_id"),
            aggregate_type: row.get("aggregate_type"),
            aggregate_id: row.get("aggregate_id"),
            event_type: row.get("event_type"),
            topic: row.get("topic"),
            schema_subject: row.get("schema_subject"),
            partition_key: row.get("partition_key"),
            payload: row.get("payload"),
        }
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn claim_batch(
        &self,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ClaimedEvent>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db_err)?;

            #[allow(clippy::cast_possible_wrap)] // batch sizes are small
            let rows = sqlx::query(
                r"
                SELECT event_id, tenant_id, aggregate_type, aggregate_id,
                       event_type, topic, schema_subject, partition_key, payload
                FROM outbox
                WHERE published_at IS NULL
                ORDER BY event_id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
                ",
            )
            .bind(max as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;

            if rows.is_empty() {
                tx.rollback().await.map_err(db_err)?;
                return Ok(Vec::new());
            }

            let events: Vec<ClaimedEvent> = rows.iter().map(Self::row_to_claimed).collect();
            let ids: Vec<i64> = events.iter().map(|e| e.event_id).collect();

            sqlx::query("UPDATE outbox SET claimed_at = NOW() WHERE event_id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

            // The claim commits before any broker I/O starts.
            tx.commit().await.map_err(db_err)?;

            tracing::debug!(claimed = events.len(), "Claimed outbox batch");
            Ok(events)
        })
    }

    fn mark_published<'a>(
        &'a self,
        events: &'a [ClaimedEvent],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut by_tenant: HashMap<&str, Vec<i64>> = HashMap::new();
            for event in events {
                by_tenant
                    .entry(event.tenant_id.as_str())
                    .or_default()
                    .push(event.event_id);
            }

            for (tenant_id, ids) in by_tenant {
                let mut tx = self.pool.begin().await.map_err(db_err)?;
                set_tenant_context(&mut tx, tenant_id).await?;

                sqlx::query("UPDATE outbox SET published_at = NOW() WHERE event_id = ANY($1)")
                    .bind(&ids)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;

                tx.commit().await.map_err(db_err)?;

                tracing::debug!(
                    tenant_id = tenant_id,
                    events = ids.len(),
                    "Marked outbox rows published"
                );
            }

            Ok(())
        })
    }
}
