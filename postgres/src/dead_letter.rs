//! `PostgreSQL` dead-letter store.
//!
//! Entries record events the dispatcher could not deliver, with enough
//! routing metadata to reconstruct a fresh outbox row. Each reclaim attempt
//! runs in a single tenant-scoped transaction and ends in exactly one of
//! three states: requeued (and deleted), rescheduled with backoff, or
//! permanently quarantined. Quarantined entries are never auto-deleted; they
//! wait for operator inspection.

use crate::{db_err, set_tenant_context};
use relaybox_core::event::{ClaimedEvent, DeadLetterEntry, ReclaimOutcome};
use relaybox_core::store::{DeadLetterStore, StoreError};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// `PostgreSQL`-backed dead-letter store.
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    /// Create a new dead-letter store with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> DeadLetterEntry {
        DeadLetterEntry {
            dlq_id: row.get("dlq_id"),
            tenant_id: row.get("tenant_id"),
            event_id: row.get("event_id"),
            event_type: row.get("event_type"),
            topic: row.get("topic"),
            payload: row.get("payload"),
            reason: row.get("reason"),
            aggregate_type: row.get("aggregate_type"),
            aggregate_id: row.get("aggregate_id"),
            schema_subject: row.get("schema_subject"),
            partition_key: row.get("partition_key"),
            retry_count: row.get("retry_count"),
        }
    }
}

impl DeadLetterStore for PostgresDeadLetterStore {
    fn record<'a>(
        &'a self,
        event: &'a ClaimedEvent,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            set_tenant_context(&mut tx, &event.tenant_id).await?;

            sqlx::query(
                r"
                INSERT INTO outbox_dlq (
                    tenant_id, event_id, event_type, topic, payload, reason,
                    aggregate_type, aggregate_id, schema_subject, partition_key,
                    next_retry_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
                ",
            )
            .bind(&event.tenant_id)
            .bind(event.event_id)
            .bind(&event.event_type)
            .bind(&event.topic)
            .bind(&event.payload)
            .bind(reason)
            .bind(&event.aggregate_type)
            .bind(&event.aggregate_id)
            .bind(&event.schema_subject)
            .bind(&event.partition_key)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            tx.commit().await.map_err(db_err)?;

            tracing::warn!(
                event_id = event.event_id,
                tenant_id = %event.tenant_id,
                event_type = %event.event_type,
                topic = %event.topic,
                reason = reason,
                "Event dead-lettered"
            );

            Ok(())
        })
    }

    fn eligible_batch(
        &self,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterEntry>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // batch sizes are small
            let rows = sqlx::query(
                r"
                SELECT dlq_id, tenant_id, event_id, event_type, topic, payload,
                       reason, aggregate_type, aggregate_id, schema_subject,
                       partition_key, retry_count
                FROM outbox_dlq
                WHERE quarantined_at IS NULL
                  AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                ORDER BY created_at
                LIMIT $1
                ",
            )
            .bind(max as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            Ok(rows.iter().map(Self::row_to_entry).collect())
        })
    }

    fn reclaim<'a>(
        &'a self,
        entry: &'a DeadLetterEntry,
        max_retries: i32,
        retry_delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ReclaimOutcome, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            set_tenant_context(&mut tx, &entry.tenant_id).await?;

            if entry.retry_count >= max_retries {
                sqlx::query(
                    r"
                    UPDATE outbox_dlq
                    SET quarantined_at = NOW(), quarantine_reason = $1
                    WHERE dlq_id = $2
                    ",
                )
                .bind("retry limit reached")
                .bind(entry.dlq_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                tx.commit().await.map_err(db_err)?;
                return Ok(ReclaimOutcome::Quarantined);
            }

            // Integrity check before touching the outbox: an entry that cannot
            // be reconstructed must stay dead-lettered, not poison the
            // transaction.
            if entry.schema_subject.is_empty() {
                let reason = format!("missing schema_subject for dlq entry {}", entry.dlq_id);
                sqlx::query(
                    r"
                    UPDATE outbox_dlq
                    SET retry_count = retry_count + 1,
                        last_attempt_at = NOW(),
                        next_retry_at = NOW() + make_interval(secs => $1),
                        reason = $2
                    WHERE dlq_id = $3
                    ",
                )
                .bind(retry_delay.as_secs_f64())
                .bind(&reason)
                .bind(entry.dlq_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                tx.commit().await.map_err(db_err)?;
                return Ok(ReclaimOutcome::Rescheduled { reason });
            }

            sqlx::query(
                r"
                INSERT INTO outbox (
                    tenant_id, aggregate_type, aggregate_id, event_type,
                    topic, schema_subject, partition_key, payload
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(&entry.tenant_id)
            .bind(&entry.aggregate_type)
            .bind(&entry.aggregate_id)
            .bind(&entry.event_type)
            .bind(&entry.topic)
            .bind(&entry.schema_subject)
            .bind(&entry.partition_key)
            .bind(&entry.payload)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            sqlx::query("DELETE FROM outbox_dlq WHERE dlq_id = $1")
                .bind(entry.dlq_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

            tx.commit().await.map_err(db_err)?;

            tracing::info!(
                dlq_id = entry.dlq_id,
                tenant_id = %entry.tenant_id,
                event_type = %entry.event_type,
                "Dead-letter entry requeued into outbox"
            );

            Ok(ReclaimOutcome::Requeued)
        })
    }

    fn backlog(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<i64, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM outbox_dlq WHERE quarantined_at IS NULL",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

            Ok(count)
        })
    }
}
