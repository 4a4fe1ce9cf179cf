//! Static event-type catalog: the closed mapping from event type to topic,
//! schema subject, JSON Schema definition and partition-key shape.
//!
//! Built once at startup. An event type missing from the catalog indicates a
//! deployment/version mismatch and is surfaced as a whole-batch dispatch
//! failure, never a silent per-row skip.

use crate::event::{EventPayload, EventType, NewOutboxEvent};
use std::collections::HashMap;

const ACTIVITY_CREATED_SCHEMA: &str = r#"{
  "type": "object",
  "title": "ActivityCreated",
  "properties": {
    "activity_id": {"type": "string"},
    "tenant_id": {"type": "string"},
    "user_id": {"type": "string"},
    "activity_type": {"type": "string"},
    "started_at": {"type": "string", "format": "date-time"},
    "duration_min": {"type": "integer"},
    "source": {"type": "string"},
    "version": {"type": "string"}
  },
  "required": ["activity_id", "tenant_id", "user_id", "activity_type", "started_at", "duration_min", "source", "version"],
  "additionalProperties": false
}"#;

const ACTIVITY_STATE_CHANGED_SCHEMA: &str = r#"{
  "type": "object",
  "title": "ActivityStateChanged",
  "properties": {
    "activity_id": {"type": "string"},
    "tenant_id": {"type": "string"},
    "user_id": {"type": "string"},
    "state": {"type": "string"},
    "occurred_at": {"type": "string", "format": "date-time"},
    "reason": {"type": "string"}
  },
  "required": ["activity_id", "tenant_id", "user_id", "state", "occurred_at"],
  "additionalProperties": false
}"#;

/// How the partition key is derived for an event type.
///
/// Same key always maps to the same broker partition, so this choice decides
/// which events serialize relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKey {
    /// `"{tenant_id}:{aggregate_id}"` — creation events fan out per tenant.
    TenantAggregate,
    /// `"{aggregate_id}"` — state transitions serialize per aggregate.
    Aggregate,
}

impl PartitionKey {
    /// Derive the concrete message key for an aggregate.
    #[must_use]
    pub fn derive(&self, tenant_id: &str, aggregate_id: &str) -> String {
        match self {
            Self::TenantAggregate => format!("{tenant_id}:{aggregate_id}"),
            Self::Aggregate => aggregate_id.to_string(),
        }
    }
}

/// Catalog entry for one event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSchema {
    /// Destination broker topic.
    pub topic: &'static str,
    /// Schema registry subject.
    pub schema_subject: &'static str,
    /// JSON Schema definition registered under the subject.
    pub schema: &'static str,
    /// Partition-key derivation for the type.
    pub partition_key: PartitionKey,
}

/// The closed event-type → schema metadata table.
#[derive(Debug, Clone)]
pub struct EventCatalog {
    entries: HashMap<EventType, EventSchema>,
}

impl EventCatalog {
    /// Build the catalog of all event types this deployment knows about.
    #[must_use]
    pub fn builtin() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            EventType::ActivityCreated,
            EventSchema {
                topic: "activity_events",
                schema_subject: "activity_events-value",
                schema: ACTIVITY_CREATED_SCHEMA,
                partition_key: PartitionKey::TenantAggregate,
            },
        );
        entries.insert(
            EventType::ActivityStateChanged,
            EventSchema {
                topic: "activity_state_changed",
                schema_subject: "activity_state_changed-value",
                schema: ACTIVITY_STATE_CHANGED_SCHEMA,
                partition_key: PartitionKey::Aggregate,
            },
        );
        Self { entries }
    }

    /// Look up the entry for a known event type.
    #[must_use]
    pub fn get(&self, event_type: EventType) -> Option<&EventSchema> {
        self.entries.get(&event_type)
    }

    /// Look up by wire name, as read from an outbox row.
    #[must_use]
    pub fn lookup(&self, event_type: &str) -> Option<&EventSchema> {
        EventType::parse(event_type).and_then(|ty| self.entries.get(&ty))
    }

    /// Build a [`NewOutboxEvent`] for an aggregate, filling routing metadata
    /// from the catalog and deriving the partition and dedupe keys.
    ///
    /// The dedupe key is `"{aggregate_id}:{event_type}"`, unique per tenant,
    /// so re-running the same write produces at most one outbox row.
    ///
    /// Returns `None` when the event type has no catalog entry.
    #[must_use]
    pub fn outbox_event(
        &self,
        event_type: EventType,
        tenant_id: &str,
        aggregate_type: &str,
        aggregate_id: &str,
        payload: serde_json::Value,
    ) -> Option<NewOutboxEvent> {
        let meta = self.get(event_type)?;
        Some(NewOutboxEvent {
            tenant_id: tenant_id.to_string(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            event_type,
            topic: meta.topic.to_string(),
            schema_subject: meta.schema_subject.to_string(),
            partition_key: meta.partition_key.derive(tenant_id, aggregate_id),
            payload,
            dedupe_key: Some(format!("{aggregate_id}:{event_type}")),
        })
    }

    /// Build a [`NewOutboxEvent`] from a typed payload, serializing it and
    /// taking the event type from the payload itself.
    ///
    /// This is the writer-side entry point: it makes payload shape and event
    /// type inseparable, where [`outbox_event`](Self::outbox_event) accepts
    /// any JSON value.
    ///
    /// Returns `None` when the event type has no catalog entry.
    ///
    /// # Errors
    ///
    /// Returns the serialization error if the payload cannot be converted to
    /// a JSON value.
    pub fn typed_outbox_event<P: EventPayload>(
        &self,
        tenant_id: &str,
        aggregate_type: &str,
        aggregate_id: &str,
        payload: &P,
    ) -> Result<Option<NewOutboxEvent>, serde_json::Error> {
        let value = serde_json::to_value(payload)?;
        Ok(self.outbox_event(P::EVENT_TYPE, tenant_id, aggregate_type, aggregate_id, value))
    }
}

impl Default for EventCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_covers_all_event_types() {
        let catalog = EventCatalog::builtin();
        for ty in [EventType::ActivityCreated, EventType::ActivityStateChanged] {
            assert!(catalog.get(ty).is_some(), "missing entry for {ty}");
        }
    }

    #[test]
    fn lookup_by_wire_name() {
        let catalog = EventCatalog::builtin();
        let meta = catalog.lookup("activity.created").unwrap();
        assert_eq!(meta.topic, "activity_events");
        assert_eq!(meta.schema_subject, "activity_events-value");
        assert!(catalog.lookup("unknown.type").is_none());
    }

    #[test]
    fn schemas_are_valid_json() {
        let catalog = EventCatalog::builtin();
        for ty in [EventType::ActivityCreated, EventType::ActivityStateChanged] {
            let meta = catalog.get(ty).unwrap();
            let parsed: serde_json::Value = serde_json::from_str(meta.schema).unwrap();
            assert_eq!(parsed["type"], "object");
        }
    }

    #[test]
    fn partition_key_shapes() {
        assert_eq!(
            PartitionKey::TenantAggregate.derive("t-1", "a-9"),
            "t-1:a-9"
        );
        assert_eq!(PartitionKey::Aggregate.derive("t-1", "a-9"), "a-9");
    }

    #[test]
    fn outbox_event_fills_routing_metadata() {
        let catalog = EventCatalog::builtin();
        let event = catalog
            .outbox_event(
                EventType::ActivityCreated,
                "t-1",
                "activity",
                "a-9",
                json!({"activity_id": "a-9"}),
            )
            .unwrap();
        assert_eq!(event.topic, "activity_events");
        assert_eq!(event.partition_key, "t-1:a-9");
        assert_eq!(event.dedupe_key.as_deref(), Some("a-9:activity.created"));
    }

    #[test]
    fn typed_outbox_event_serializes_payload_and_routes() {
        use crate::event::{ActivityCreated, ActivityStateChanged};
        let catalog = EventCatalog::builtin();

        let created = ActivityCreated {
            activity_id: "a-9".to_string(),
            tenant_id: "t-1".to_string(),
            user_id: "u-1".to_string(),
            activity_type: "run".to_string(),
            started_at: chrono::Utc::now(),
            duration_min: 45,
            source: "manual".to_string(),
            version: "1".to_string(),
        };
        let event = catalog
            .typed_outbox_event("t-1", "activity", "a-9", &created)
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, EventType::ActivityCreated);
        assert_eq!(event.topic, "activity_events");
        assert_eq!(event.payload["duration_min"], 45);

        let changed = ActivityStateChanged {
            activity_id: "a-9".to_string(),
            tenant_id: "t-1".to_string(),
            user_id: "u-1".to_string(),
            state: "synced".to_string(),
            occurred_at: chrono::Utc::now(),
            reason: None,
        };
        let event = catalog
            .typed_outbox_event("t-1", "activity", "a-9", &changed)
            .unwrap()
            .unwrap();
        assert_eq!(event.topic, "activity_state_changed");
        assert_eq!(event.partition_key, "a-9");
        assert!(event.payload.get("reason").is_none());
    }
}
