// ============================================================================
// Event Sourcing Store - Persistence Layer
// ============================================================================
//
// Event and snapshot stores (in-memory and PostgreSQL) plus the generic
// aggregate repository built on top of them.
//
// ============================================================================

pub mod event_store;
pub mod in_memory;
pub mod postgres;
pub mod repository;
pub mod snapshot_store;

pub use event_store::EventStore;
pub use in_memory::{InMemoryEventStore, InMemorySnapshotStore};
pub use postgres::{PostgresEventStore, PostgresSnapshotStore};
pub use repository::AggregateRepository;
pub use snapshot_store::{SnapshotPolicy, SnapshotStore, DEFAULT_SNAPSHOT_INTERVAL};
