use uuid::Uuid;

use super::event::AggregateId;
use super::event_name::InvalidEventName;
use crate::errors::{ErrorCategory, ServiceError};

// ============================================================================
// Event Sourcing Errors
// ============================================================================

/// Another writer extended the stream first.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "Optimistic concurrency conflict on {event_name} for aggregate {aggregate_id}: \
     expected version {expected_version}, last stored version {last_event_version} \
     (sequence {last_event_sequence}, event {last_event_id})"
)]
pub struct OptimisticConcurrencyError {
    pub event_name: String,
    pub aggregate_id: AggregateId,
    pub expected_version: u64,
    pub last_event_version: u64,
    pub last_event_sequence: u64,
    pub last_event_id: Uuid,
}

/// A stored stream does not line up with the aggregate it is replayed onto.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "Replay version mismatch for aggregate {aggregate_id}: at version {aggregate_version}, \
     got event {event_id} with version {event_version}"
)]
pub struct ReplayVersionMismatchError {
    pub aggregate_id: AggregateId,
    pub aggregate_version: u64,
    pub event_version: u64,
    pub event_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum EventSourcingError {
    #[error(transparent)]
    OptimisticConcurrency(#[from] OptimisticConcurrencyError),

    #[error(transparent)]
    ReplayVersionMismatch(#[from] ReplayVersionMismatchError),

    #[error(transparent)]
    InvalidEventName(#[from] InvalidEventName),

    #[error("No handler registered for event {0}")]
    UnregisteredEvent(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid table name: {0}")]
    InvalidTableName(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ServiceError for EventSourcingError {
    fn category(&self) -> ErrorCategory {
        match self {
            EventSourcingError::OptimisticConcurrency(_) => ErrorCategory::Aborted,
            EventSourcingError::InvalidEventName(_) => ErrorCategory::InvalidArgument,
            EventSourcingError::Database(sqlx::Error::PoolTimedOut)
            | EventSourcingError::Database(sqlx::Error::PoolClosed)
            | EventSourcingError::Database(sqlx::Error::Io(_)) => ErrorCategory::Unavailable,
            EventSourcingError::ReplayVersionMismatch(_)
            | EventSourcingError::UnregisteredEvent(_)
            | EventSourcingError::Serialization(_)
            | EventSourcingError::InvalidTableName(_)
            | EventSourcingError::Database(_) => ErrorCategory::Internal,
        }
    }
}
