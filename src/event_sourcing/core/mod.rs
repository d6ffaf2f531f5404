// ============================================================================
// Event Sourcing Core - Generic Infrastructure Abstractions
// ============================================================================
//
// Versioning primitives, event naming, the aggregate trait and the errors
// shared by every store and aggregate. Nothing domain-specific lives here.
//
// ============================================================================

pub mod aggregate;
pub mod errors;
pub mod event;
pub mod event_name;
pub mod events_stream;
pub mod stream_version;

pub use aggregate::{Aggregate, AggregateRoot, EventHandlers, RegistryError};
pub use errors::{EventSourcingError, OptimisticConcurrencyError, ReplayVersionMismatchError};
pub use event::{AggregateId, DomainEvent, EventPayload, StoredEvent, StoredSnapshot};
pub use event_name::{is_valid_topic, EventName, InvalidEventName};
pub use events_stream::{EventsStream, StreamEvent};
pub use stream_version::StreamVersion;
