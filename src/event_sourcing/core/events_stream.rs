use serde_json::Value;

use super::event::AggregateId;
use super::event_name::EventName;
use super::stream_version::StreamVersion;

/// One uncommitted event, already in its serialized form, tagged with the
/// aggregate version reached after applying it.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub name: EventName,
    pub data: Value,
    pub version: StreamVersion,
}

/// Ordered buffer of events applied to one aggregate since it was loaded.
///
/// Drained as a whole by `Aggregate::reset_events`; never partially.
#[derive(Debug, Clone, PartialEq)]
pub struct EventsStream {
    aggregate_id: AggregateId,
    events: Vec<StreamEvent>,
}

impl EventsStream {
    pub fn new(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id,
            events: Vec::new(),
        }
    }

    pub fn with_events(aggregate_id: AggregateId, events: Vec<StreamEvent>) -> Self {
        Self { aggregate_id, events }
    }

    pub fn push(&mut self, name: EventName, data: Value, version: StreamVersion) {
        self.events.push(StreamEvent { name, data, version });
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamEvent> {
        self.events.iter()
    }

    pub fn first(&self) -> Option<&StreamEvent> {
        self.events.first()
    }

    pub fn last_version(&self) -> Option<StreamVersion> {
        self.events.last().map(|e| e.version)
    }
}
