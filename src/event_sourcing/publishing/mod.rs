// ============================================================================
// Domain Events Publishing - in-process fan-out
// ============================================================================
//
// Stores publish every committed batch here; projections and the
// notification bridge subscribe through filtered listeners.
//
// ============================================================================

mod listener;
mod publisher;

pub use listener::{EventFilter, EventStream};
pub use publisher::{DomainEventsListener, DomainEventsPublisher, DEFAULT_PUBLISHER_CAPACITY};
