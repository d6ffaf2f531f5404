use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::event_name::EventName;

// ============================================================================
// Aggregate Identity
// ============================================================================

/// Opaque aggregate identifier. New ids are UUID v4 strings; ids coming back
/// from storage or the broker are taken as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

impl AggregateId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AggregateId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AggregateId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Domain Event Traits
// ============================================================================

/// The event type of one aggregate, usually an enum with one variant per
/// payload.
pub trait DomainEvent: Clone + fmt::Debug + Send + Sync + 'static {
    /// Canonical names of every variant; used to validate handler tables.
    fn names() -> &'static [&'static str];

    /// Canonical name of this event.
    fn name(&self) -> &'static str;

    fn data(&self) -> Result<Value, serde_json::Error>;
}

/// A single event payload and its place inside the aggregate's event enum.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Event: DomainEvent;

    const NAME: &'static str;

    fn wrap(self) -> Self::Event;

    fn unwrap(event: &Self::Event) -> Option<&Self>;
}

// ============================================================================
// Persisted Envelopes
// ============================================================================

/// An event as it lives in the store and travels to listeners and brokers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    /// Aggregate-local version after this event.
    pub version: u64,
    pub name: EventName,
    pub data: Value,
    pub inserted_at: DateTime<Utc>,
    /// Store-wide position, gapless.
    pub sequence: u64,
}

impl StoredEvent {
    pub fn topic(&self) -> String {
        self.name.topic()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSnapshot {
    pub aggregate_id: AggregateId,
    pub version: u64,
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_stored_event_wire_shape() {
        let event = StoredEvent {
            event_id: Uuid::nil(),
            aggregate_id: AggregateId::from("u1"),
            version: 1,
            name: EventName::parse("authentication.user:created").unwrap(),
            data: json!({"id": "u1", "email": "a@b.com"}),
            inserted_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            sequence: 42,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "eventId": "00000000-0000-0000-0000-000000000000",
                "aggregateId": "u1",
                "version": 1,
                "name": "authentication.user:created",
                "data": {"id": "u1", "email": "a@b.com"},
                "insertedAt": "2024-01-02T03:04:05Z",
                "sequence": 42
            })
        );
        assert_eq!(event.topic(), "authentication.events.user");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(AggregateId::generate(), AggregateId::generate());
    }
}
