//! The dead-letter reclaim loop: retry with backoff, quarantine on
//! exhaustion.

use crate::config::DispatchConfig;
use relaybox_core::backoff::BackoffPolicy;
use relaybox_core::event::ReclaimOutcome;
use relaybox_core::store::{DeadLetterStore, StoreError};
use std::sync::Arc;
use tokio::sync::watch;

/// What one reclaim cycle did, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Entries re-inserted into the outbox.
    pub requeued: usize,
    /// Entries that exhausted their retry budget.
    pub quarantined: usize,
    /// Entries rescheduled for a later attempt.
    pub rescheduled: usize,
    /// Entries whose reclaim attempt itself errored.
    pub failed: usize,
}

/// Periodically retries dead-lettered events.
///
/// Each eligible entry gets one attempt per cycle: requeue into the outbox,
/// quarantine if the retry budget is spent, or reschedule with exponentially
/// growing delay. One entry's failure never blocks the rest of the batch.
pub struct DlqReclaimer {
    dead_letters: Arc<dyn DeadLetterStore>,
    backoff: BackoffPolicy,
    config: DispatchConfig,
    shutdown: watch::Receiver<bool>,
}

impl DlqReclaimer {
    /// Create a reclaimer and the sender that shuts it down.
    #[must_use]
    pub fn new(
        dead_letters: Arc<dyn DeadLetterStore>,
        config: DispatchConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backoff = BackoffPolicy::builder()
            .base_delay(config.base_retry_delay)
            .build();
        let reclaimer = Self {
            dead_letters,
            backoff,
            config,
            shutdown: shutdown_rx,
        };
        (reclaimer, shutdown_tx)
    }

    /// Run the reclaim loop until shutdown is signalled.
    pub async fn run(mut self) {
        tracing::info!(
            poll_interval = ?self.config.dlq_poll_interval,
            batch_size = self.config.dlq_batch_size,
            max_retries = self.config.max_retries,
            "Starting DLQ reclaimer"
        );
        let mut ticker = tokio::time::interval(self.config.dlq_poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(stats) if stats == ReclaimStats::default() => {}
                        Ok(stats) => {
                            tracing::info!(
                                requeued = stats.requeued,
                                quarantined = stats.quarantined,
                                rescheduled = stats.rescheduled,
                                failed = stats.failed,
                                "Reclaim cycle finished"
                            );
                        }
                        Err(error) => {
                            metrics::counter!("outbox_dlq_cycle_errors_total").increment(1);
                            tracing::error!(%error, "Reclaim cycle failed");
                        }
                    }
                }
                changed = self.shutdown.changed() => {
                    // A dropped sender counts as shutdown, matching the
                    // dispatcher loop.
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("DLQ reclaimer stopped");
    }

    /// Run one reclaim cycle over the eligible entries.
    ///
    /// Per-entry store errors are counted and logged, not propagated; the
    /// entry stays in place and becomes eligible again next cycle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] only when the eligible-entry selection itself
    /// fails.
    pub async fn run_once(&self) -> Result<ReclaimStats, StoreError> {
        let entries = self
            .dead_letters
            .eligible_batch(self.config.dlq_batch_size)
            .await?;
        let mut stats = ReclaimStats::default();

        for entry in &entries {
            let attempt = u32::try_from(entry.retry_count).unwrap_or(0) + 1;
            let delay = self.backoff.delay_for_attempt(attempt);
            match self
                .dead_letters
                .reclaim(entry, self.config.max_retries, delay)
                .await
            {
                Ok(ReclaimOutcome::Requeued) => {
                    stats.requeued += 1;
                    metrics::counter!(
                        "outbox_dlq_reclaimed_total",
                        "outcome" => "requeued",
                        "topic" => entry.topic.clone()
                    )
                    .increment(1);
                    tracing::info!(
                        dlq_id = entry.dlq_id,
                        event_type = %entry.event_type,
                        "Dead-letter entry requeued"
                    );
                }
                Ok(ReclaimOutcome::Quarantined) => {
                    stats.quarantined += 1;
                    metrics::counter!(
                        "outbox_dlq_reclaimed_total",
                        "outcome" => "quarantined",
                        "topic" => entry.topic.clone()
                    )
                    .increment(1);
                    tracing::warn!(
                        dlq_id = entry.dlq_id,
                        event_type = %entry.event_type,
                        retry_count = entry.retry_count,
                        "Dead-letter entry quarantined"
                    );
                }
                Ok(ReclaimOutcome::Rescheduled { reason }) => {
                    stats.rescheduled += 1;
                    metrics::counter!(
                        "outbox_dlq_reclaimed_total",
                        "outcome" => "rescheduled",
                        "topic" => entry.topic.clone()
                    )
                    .increment(1);
                    tracing::warn!(
                        dlq_id = entry.dlq_id,
                        delay_secs = delay.as_secs(),
                        %reason,
                        "Dead-letter entry rescheduled"
                    );
                }
                Err(error) => {
                    stats.failed += 1;
                    tracing::error!(dlq_id = entry.dlq_id, %error, "Reclaim attempt failed");
                }
            }
        }

        match self.dead_letters.backlog().await {
            Ok(backlog) => {
                #[allow(clippy::cast_precision_loss)]
                metrics::gauge!("outbox_dlq_backlog").set(backlog as f64);
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to read DLQ backlog");
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use relaybox_core::event::DeadLetterEntry;
    use relaybox_testing::{InMemoryDeadLetterStore, InMemoryOutboxStore};
    use serde_json::json;
    use std::time::Duration;

    fn entry(retry_count: i32, schema_subject: &str) -> DeadLetterEntry {
        DeadLetterEntry {
            dlq_id: 0,
            tenant_id: "t-1".to_string(),
            event_id: Some(10),
            event_type: "activity.created".to_string(),
            topic: "activity_events".to_string(),
            payload: json!({"activity_id": "a-1"}),
            reason: "publish failed".to_string(),
            aggregate_type: "activity".to_string(),
            aggregate_id: "a-1".to_string(),
            schema_subject: schema_subject.to_string(),
            partition_key: "t-1:a-1".to_string(),
            retry_count,
        }
    }

    #[tokio::test]
    async fn requeues_entry_into_outbox_and_deletes_it() {
        let outbox = InMemoryOutboxStore::new();
        let dlq = InMemoryDeadLetterStore::linked_to(outbox.clone());
        // One attempt left in the default budget of 5.
        dlq.seed(entry(4, "activity_events-value")).await;
        let (reclaimer, _shutdown) = DlqReclaimer::new(dlq.clone(), DispatchConfig::default());

        let stats = reclaimer.run_once().await.unwrap();

        assert_eq!(stats.requeued, 1);
        assert!(dlq.entries().await.is_empty());
        assert_eq!(outbox.pending_count().await, 1);
    }

    #[tokio::test]
    async fn quarantines_entry_at_retry_budget() {
        let dlq = InMemoryDeadLetterStore::new();
        let id = dlq.seed(entry(5, "activity_events-value")).await;
        let (reclaimer, _shutdown) = DlqReclaimer::new(dlq.clone(), DispatchConfig::default());

        let stats = reclaimer.run_once().await.unwrap();

        assert_eq!(stats.quarantined, 1);
        assert_eq!(
            dlq.quarantine_reason(id).await.as_deref(),
            Some("retry limit reached")
        );
        // Quarantined entries leave the eligible pool for good.
        let stats = reclaimer.run_once().await.unwrap();
        assert_eq!(stats, ReclaimStats::default());
    }

    #[tokio::test]
    async fn reschedules_entry_missing_schema_subject() {
        let dlq = InMemoryDeadLetterStore::new();
        let id = dlq.seed(entry(1, "")).await;
        let (reclaimer, _shutdown) = DlqReclaimer::new(dlq.clone(), DispatchConfig::default());

        let stats = reclaimer.run_once().await.unwrap();

        assert_eq!(stats.rescheduled, 1);
        let entries = dlq.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_count, 2);
        assert_eq!(
            entries[0].reason,
            format!("missing schema_subject for dlq entry {id}")
        );
        // Backoff pushed next_retry_at into the future, so the entry is no
        // longer eligible this cycle.
        let stats = reclaimer.run_once().await.unwrap();
        assert_eq!(stats, ReclaimStats::default());
    }

    #[tokio::test]
    async fn empty_queue_is_a_noop_cycle() {
        let dlq = InMemoryDeadLetterStore::new();
        let (reclaimer, _shutdown) = DlqReclaimer::new(dlq, DispatchConfig::default());
        assert_eq!(reclaimer.run_once().await.unwrap(), ReclaimStats::default());
    }

    #[tokio::test]
    async fn backoff_delay_grows_with_retry_count() {
        let (reclaimer, _shutdown) =
            DlqReclaimer::new(InMemoryDeadLetterStore::new(), DispatchConfig::default());
        assert_eq!(
            reclaimer.backoff.delay_for_attempt(1),
            Duration::from_secs(60)
        );
        assert_eq!(
            reclaimer.backoff.delay_for_attempt(4),
            Duration::from_secs(480)
        );
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_loop() {
        let dlq = InMemoryDeadLetterStore::new();
        let (reclaimer, shutdown) = DlqReclaimer::new(dlq, DispatchConfig::default());
        let handle = tokio::spawn(reclaimer.run());
        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reclaimer did not stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_shutdown_sender_stops_the_loop() {
        let dlq = InMemoryDeadLetterStore::new();
        let (reclaimer, shutdown) = DlqReclaimer::new(dlq, DispatchConfig::default());
        let handle = tokio::spawn(reclaimer.run());
        drop(shutdown);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reclaimer did not stop when sender was dropped")
            .unwrap();
    }
}
