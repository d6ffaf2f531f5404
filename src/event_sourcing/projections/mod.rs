// ============================================================================
// Projections - read models fed by stored events
// ============================================================================
//
// A projector group owns one read model and one offset per topic it
// handles. Live events arrive through a DomainEventsListener; anything
// missed is replayed from the event store.
//
// ============================================================================

pub mod handlers;
pub mod offset_store;
pub mod projector;

pub use handlers::{EventHandlerTable, HandlerRegistrationError};
pub use offset_store::{InMemoryOffsetStore, OffsetRecord, OffsetStore, PostgresOffsetStore};
pub use projector::{ProjectionError, Projector};
