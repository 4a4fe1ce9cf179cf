//! Event types flowing through the outbox pipeline.
//!
//! The same logical event is represented at three lifecycle stages:
//!
//! - [`NewOutboxEvent`]: writer-side input, appended inside the writer's
//!   transaction.
//! - [`ClaimedEvent`]: a row fetched from the outbox table by a dispatch
//!   cycle, carrying everything needed to encode and route it.
//! - [`DeadLetterEntry`]: a row in the dead-letter table, carrying the full
//!   routing metadata forward so it can be reconstructed into a fresh outbox
//!   row without re-deriving context.
//!
//! An event is in exactly one of these representations at any instant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed enumeration of event types known at build time.
///
/// Adding an event type is a deployment-time change that requires schema
/// coordination, so this is a fixed enum rather than an extensible registry.
/// A row whose `event_type` column does not parse as one of these variants is
/// dead-lettered by the dispatcher, never published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A new activity was accepted (`activity.created`).
    ActivityCreated,
    /// An activity transitioned processing state (`activity.state_changed`).
    ActivityStateChanged,
}

impl EventType {
    /// Wire name of the event type, as stored in the `event_type` column.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ActivityCreated => "activity.created",
            Self::ActivityStateChanged => "activity.state_changed",
        }
    }

    /// Parse a wire name back into an event type.
    ///
    /// Returns `None` for unknown names; callers decide how loudly to fail
    /// (the dispatcher treats it as a whole-batch error).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "activity.created" => Some(Self::ActivityCreated),
            "activity.state_changed" => Some(Self::ActivityStateChanged),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A serializable payload that knows which event type it belongs to.
///
/// Writers go through
/// [`EventCatalog::typed_outbox_event`](crate::catalog::EventCatalog::typed_outbox_event)
/// with one of these instead of hand-building a JSON value, so payload shape
/// and event type can never drift apart.
pub trait EventPayload: Serialize {
    /// The event type this payload serializes as.
    const EVENT_TYPE: EventType;
}

/// Payload of an `activity.created` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityCreated {
    /// Aggregate id of the activity.
    pub activity_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// User the activity belongs to.
    pub user_id: String,
    /// Kind of activity (e.g. "run", "strength").
    pub activity_type: String,
    /// When the activity started.
    pub started_at: DateTime<Utc>,
    /// Duration in minutes.
    pub duration_min: i32,
    /// Source system ("manual", "import", ...).
    pub source: String,
    /// Payload contract version.
    pub version: String,
}

impl EventPayload for ActivityCreated {
    const EVENT_TYPE: EventType = EventType::ActivityCreated;
}

/// Payload of an `activity.state_changed` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityStateChanged {
    /// Aggregate id of the activity.
    pub activity_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// User the activity belongs to.
    pub user_id: String,
    /// New processing state (pending, synced, failed).
    pub state: String,
    /// When the transition happened.
    pub occurred_at: DateTime<Utc>,
    /// Optional human-readable reason for the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EventPayload for ActivityStateChanged {
    const EVENT_TYPE: EventType = EventType::ActivityStateChanged;
}

/// A pending event to be appended to the outbox table.
///
/// Built by the writer, typically via [`crate::catalog::EventCatalog`] which
/// fills in topic, schema subject and partition key for the event type.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    /// Owning tenant.
    pub tenant_id: String,
    /// Aggregate type that produced the event (e.g. "activity").
    pub aggregate_type: String,
    /// Aggregate id that produced the event.
    pub aggregate_id: String,
    /// Event type discriminator.
    pub event_type: EventType,
    /// Destination broker topic.
    pub topic: String,
    /// Schema registry subject for the payload.
    pub schema_subject: String,
    /// Message key; events with the same key never reorder.
    pub partition_key: String,
    /// Structured payload, validated against the subject's schema downstream.
    pub payload: serde_json::Value,
    /// Optional per-tenant dedupe key making retried writes idempotent.
    pub dedupe_key: Option<String>,
}

/// An outbox row claimed by a dispatch cycle.
///
/// `event_type` stays a raw string here: the row may predate (or postdate)
/// this binary, and the mismatch must surface as a dead-letter reason rather
/// than a deserialization failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedEvent {
    /// Monotonic sequence id, the global ordering key.
    pub event_id: i64,
    /// Owning tenant.
    pub tenant_id: String,
    /// Aggregate type that produced the event.
    pub aggregate_type: String,
    /// Aggregate id that produced the event.
    pub aggregate_id: String,
    /// Event type wire name.
    pub event_type: String,
    /// Destination broker topic.
    pub topic: String,
    /// Schema registry subject.
    pub schema_subject: String,
    /// Message key.
    pub partition_key: String,
    /// Structured payload.
    pub payload: serde_json::Value,
}

/// A dead-letter row selected for a reclaim attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    /// Dead-letter row id.
    pub dlq_id: i64,
    /// Owning tenant.
    pub tenant_id: String,
    /// Original outbox event id, if known.
    pub event_id: Option<i64>,
    /// Event type wire name.
    pub event_type: String,
    /// Destination broker topic.
    pub topic: String,
    /// Original payload, carried forward verbatim.
    pub payload: serde_json::Value,
    /// Most recent failure reason.
    pub reason: String,
    /// Aggregate type, carried forward for reconstruction.
    pub aggregate_type: String,
    /// Aggregate id, carried forward for reconstruction.
    pub aggregate_id: String,
    /// Schema subject, carried forward for reconstruction.
    pub schema_subject: String,
    /// Partition key, carried forward for reconstruction.
    pub partition_key: String,
    /// Number of reclaim attempts so far.
    pub retry_count: i32,
}

/// Terminal state of one reclaim attempt for a dead-letter entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// The entry was re-inserted into the outbox and deleted from the DLQ.
    Requeued,
    /// The entry exhausted its retry budget and was permanently quarantined.
    Quarantined,
    /// The requeue failed; the entry stays dead-lettered with backoff
    /// bookkeeping updated.
    Rescheduled {
        /// Why the requeue failed.
        reason: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn event_type_roundtrip() {
        for ty in [EventType::ActivityCreated, EventType::ActivityStateChanged] {
            assert_eq!(EventType::parse(ty.as_str()), Some(ty));
        }
    }

    #[test]
    fn event_type_unknown() {
        assert_eq!(EventType::parse("unknown.type"), None);
        assert_eq!(EventType::parse(""), None);
    }

    #[test]
    fn state_changed_reason_omitted_when_none() {
        let payload = ActivityStateChanged {
            activity_id: "a-1".to_string(),
            tenant_id: "t-1".to_string(),
            user_id: "u-1".to_string(),
            state: "synced".to_string(),
            occurred_at: Utc::now(),
            reason: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("reason").is_none());
    }
}
