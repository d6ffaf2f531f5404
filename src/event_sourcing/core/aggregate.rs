use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use super::errors::{EventSourcingError, ReplayVersionMismatchError};
use super::event::{AggregateId, DomainEvent, EventPayload, StoredEvent, StoredSnapshot};
use super::event_name::EventName;
use super::events_stream::{EventsStream, StreamEvent};
use super::stream_version::StreamVersion;

// ============================================================================
// Aggregate Root Pattern - Event Sourcing Core
// ============================================================================
//
// Key Principles:
// 1. State is derived from events (not stored directly)
// 2. Mutation happens only through `apply`, which records the event
// 3. Replay checks that stored versions line up one by one
// 4. Each aggregate type has one handler table, built once per process
//
// Concrete aggregates embed an `AggregateRoot` for versioning and keep
// their own state next to it.
//
// ============================================================================

/// Versioning state shared by every aggregate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateRoot {
    version: StreamVersion,
    persisted_version: StreamVersion,
    pending: Vec<StreamEvent>,
}

impl AggregateRoot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> StreamVersion {
        self.version
    }

    pub fn persisted_version(&self) -> StreamVersion {
        self.persisted_version
    }

    pub fn has_pending_events(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Called once the events up to `version` are durably stored.
    pub fn mark_persisted(&mut self, version: StreamVersion) {
        if version > self.persisted_version {
            self.persisted_version = version;
        }
    }

    fn record(&mut self, name: EventName, data: Value) {
        self.version.next();
        self.pending.push(StreamEvent {
            name,
            data,
            version: self.version,
        });
    }

    fn advance_replayed(&mut self) {
        self.version.next();
        self.persisted_version.next();
    }

    fn restore(&mut self, version: StreamVersion) {
        self.version = version;
        self.persisted_version = version;
    }

    fn take_pending(&mut self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.pending)
    }
}

// ============================================================================
// Handler Tables
// ============================================================================

type DecodeFn<A> =
    Box<dyn Fn(Value) -> Result<<A as Aggregate>::Event, serde_json::Error> + Send + Sync>;
type MutateFn<A> = Box<dyn Fn(&mut A, &<A as Aggregate>::Event) + Send + Sync>;

struct Handler<A: Aggregate> {
    decode: DecodeFn<A>,
    mutate: MutateFn<A>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{aggregate}: event {event} has no handler")]
    MissingHandler { aggregate: &'static str, event: &'static str },

    #[error("{aggregate}: handler registered for undeclared event {event}")]
    UndeclaredEvent { aggregate: &'static str, event: &'static str },

    #[error("{aggregate}: handler registered twice for {event}")]
    DuplicateHandler { aggregate: &'static str, event: &'static str },

    #[error("{aggregate}: {event} is not a canonical event name")]
    InvalidName { aggregate: &'static str, event: &'static str },
}

/// Event name -> (decoder, mutation) for one aggregate type.
pub struct EventHandlers<A: Aggregate> {
    aggregate: &'static str,
    handlers: HashMap<&'static str, Handler<A>>,
    duplicates: Vec<&'static str>,
}

impl<A: Aggregate> EventHandlers<A> {
    pub fn new(aggregate: &'static str) -> Self {
        Self {
            aggregate,
            handlers: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    /// Register the mutation for payload `P`; its decoder comes along.
    pub fn on<P>(mut self, mutate: fn(&mut A, &P)) -> Self
    where
        P: EventPayload<Event = A::Event>,
    {
        let handler = Handler {
            decode: Box::new(|data: Value| serde_json::from_value::<P>(data).map(P::wrap)),
            mutate: Box::new(move |aggregate: &mut A, event: &A::Event| {
                if let Some(payload) = P::unwrap(event) {
                    mutate(aggregate, payload);
                }
            }),
        };

        if self.handlers.insert(P::NAME, handler).is_some() {
            self.duplicates.push(P::NAME);
        }
        self
    }

    /// Completeness check run at startup.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let aggregate = self.aggregate;

        if let Some(event) = self.duplicates.first() {
            return Err(RegistryError::DuplicateHandler { aggregate, event });
        }

        let declared = A::Event::names();
        for &event in declared {
            match EventName::parse(event) {
                Ok(name) if name.to_string() == event => {}
                _ => return Err(RegistryError::InvalidName { aggregate, event }),
            }
            if !self.handlers.contains_key(event) {
                return Err(RegistryError::MissingHandler { aggregate, event });
            }
        }

        if let Some(&event) = self.handlers.keys().find(|name| !declared.contains(*name)) {
            return Err(RegistryError::UndeclaredEvent { aggregate, event });
        }

        Ok(())
    }

    pub fn aggregate_type(&self) -> &'static str {
        self.aggregate
    }

    pub fn decode(&self, name: &EventName, data: Value) -> Result<A::Event, EventSourcingError> {
        let canonical = name.to_string();
        let handler = self
            .handlers
            .get(canonical.as_str())
            .ok_or(EventSourcingError::UnregisteredEvent(canonical))?;
        Ok((handler.decode)(data)?)
    }

    pub fn mutate(&self, aggregate: &mut A, event: &A::Event) -> Result<(), EventSourcingError> {
        let handler = self
            .handlers
            .get(event.name())
            .ok_or_else(|| EventSourcingError::UnregisteredEvent(event.name().to_string()))?;
        (handler.mutate)(aggregate, event);
        Ok(())
    }
}

// ============================================================================
// Aggregate Trait
// ============================================================================

/// Event-sourced aggregate.
///
/// Implementors provide their handler table, access to the embedded
/// `AggregateRoot`, and a serializable state for snapshots. Everything else
/// comes from the provided methods.
pub trait Aggregate: Default + Send + Sync + Sized + 'static {
    type Event: DomainEvent;
    type State: Serialize + DeserializeOwned;

    fn handlers() -> &'static EventHandlers<Self>;

    fn aggregate_id(&self) -> &AggregateId;

    fn root(&self) -> &AggregateRoot;

    fn root_mut(&mut self) -> &mut AggregateRoot;

    fn serialize_state(&self) -> Self::State;

    fn apply_state(&mut self, state: Self::State);

    fn aggregate_version(&self) -> u64 {
        self.root().version().value()
    }

    fn persisted_version(&self) -> u64 {
        self.root().persisted_version().value()
    }

    /// Mutate through the registered handler and record the event.
    fn apply(&mut self, event: Self::Event) -> Result<(), EventSourcingError> {
        let name = EventName::parse(event.name())?;
        let data = event.data()?;

        Self::handlers().mutate(self, &event)?;
        self.root_mut().record(name, data);
        Ok(())
    }

    /// Replays stored events in ascending version order.
    fn replay_events(&mut self, events: &[StoredEvent]) -> Result<(), EventSourcingError> {
        let handlers = Self::handlers();

        for stored in events {
            let current = self.aggregate_version();
            if current + 1 != stored.version {
                return Err(ReplayVersionMismatchError {
                    aggregate_id: stored.aggregate_id.clone(),
                    aggregate_version: current,
                    event_version: stored.version,
                    event_id: stored.event_id,
                }
                .into());
            }

            let event = handlers.decode(&stored.name, stored.data.clone())?;
            handlers.mutate(self, &event)?;
            self.root_mut().advance_replayed();
        }

        Ok(())
    }

    fn apply_snapshot(
        &mut self,
        snapshot: &StoredSnapshot,
        events_after: &[StoredEvent],
    ) -> Result<(), EventSourcingError> {
        let state: Self::State = serde_json::from_value(snapshot.data.clone())?;
        self.apply_state(state);
        self.root_mut().restore(StreamVersion::from(snapshot.version));
        self.replay_events(events_after)
    }

    /// Rebuild from history; with a snapshot only the newer events are
    /// replayed.
    fn build_from(
        events: &[StoredEvent],
        snapshot: Option<&StoredSnapshot>,
    ) -> Result<Self, EventSourcingError> {
        let mut aggregate = Self::default();

        match snapshot {
            Some(snapshot) => {
                let start = events.partition_point(|e| e.version <= snapshot.version);
                aggregate.apply_snapshot(snapshot, &events[start..])?;
            }
            None => aggregate.replay_events(events)?,
        }

        Ok(aggregate)
    }

    /// Serialized state at the current version. Take it after saving.
    fn snapshot(&self) -> Result<StoredSnapshot, EventSourcingError> {
        Ok(StoredSnapshot {
            aggregate_id: self.aggregate_id().clone(),
            version: self.aggregate_version(),
            data: serde_json::to_value(self.serialize_state())?,
        })
    }

    /// Hand over the pending events; the aggregate keeps none.
    fn reset_events(&mut self) -> EventsStream {
        let pending = self.root_mut().take_pending();
        EventsStream::with_events(self.aggregate_id().clone(), pending)
    }
}

// ============================================================================
// Tests
// ============================================================================
