// ============================================================================
// Event Sourcing Infrastructure
// ============================================================================
//
// Generic, reusable event sourcing infrastructure.
// Domain-specific code is in src/domain/
//
// ============================================================================

// Versioning, naming and the Aggregate trait
pub mod core;
// Event and snapshot stores, repository
pub mod store;
// In-process fan-out of committed events
pub mod publishing;
// Read models with gapless offsets
pub mod projections;

pub use core::*;
pub use projections::{EventHandlerTable, OffsetStore, ProjectionError, Projector};
pub use publishing::{DomainEventsListener, DomainEventsPublisher, EventFilter, EventStream};
pub use store::*;
