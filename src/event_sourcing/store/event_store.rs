use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::event_sourcing::core::{
    AggregateId, EventSourcingError, EventsStream, OptimisticConcurrencyError, StoredEvent,
};

// ============================================================================
// Event Store - append-only log with optimistic concurrency
// ============================================================================
//
// One store instance holds one stream family (one aggregate type), so its
// `sequence` is gapless per topic as well as per store.
//
// Responsibilities:
// 1. Append a drained EventsStream if the caller's expected version is
//    still the last stored version (check and write are one atomic step)
// 2. Assign event ids, sequences and insertion times
// 3. Publish the committed batch to in-process listeners
// 4. Serve per-aggregate and global reads in order
//
// ============================================================================

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Name used in logs and metrics, e.g. `user_events`.
    fn name(&self) -> &str;

    /// Events of one aggregate with `version > after`, ascending.
    async fn get_events_for_aggregate(
        &self,
        aggregate_id: &AggregateId,
        after: Option<u64>,
    ) -> Result<Vec<StoredEvent>, EventSourcingError>;

    /// The whole log with `sequence > after`, ascending.
    async fn get_all_events(&self, after: u64) -> Result<Vec<StoredEvent>, EventSourcingError>;

    /// Append `stream` if the aggregate's last stored version equals
    /// `expected_version`. An empty stream is a no-op.
    ///
    /// The appended events are published once committed. Publishing happens
    /// outside the store's write lock, so with concurrent writers listeners
    /// may see sequences out of order; projectors reject the gap and replay
    /// from `get_all_events`, which is always in sequence order.
    async fn store_events(
        &self,
        stream: &EventsStream,
        expected_version: u64,
    ) -> Result<Vec<StoredEvent>, EventSourcingError>;
}

/// Envelope every buffered event with an id, a sequence starting at
/// `first_sequence`, and one shared insertion time.
pub(crate) fn stamp_events(stream: &EventsStream, first_sequence: u64) -> Vec<StoredEvent> {
    let inserted_at = Utc::now();

    stream
        .iter()
        .zip(first_sequence..)
        .map(|(event, sequence)| StoredEvent {
            event_id: Uuid::new_v4(),
            aggregate_id: stream.aggregate_id().clone(),
            version: event.version.value(),
            name: event.name.clone(),
            data: event.data.clone(),
            inserted_at,
            sequence,
        })
        .collect()
}

pub(crate) fn concurrency_conflict(
    stream: &EventsStream,
    expected_version: u64,
    last_version: u64,
    last_sequence: u64,
    last_event_id: Uuid,
) -> OptimisticConcurrencyError {
    OptimisticConcurrencyError {
        event_name: stream
            .first()
            .map(|e| e.name.to_string())
            .unwrap_or_default(),
        aggregate_id: stream.aggregate_id().clone(),
        expected_version,
        last_event_version: last_version,
        last_event_sequence: last_sequence,
        last_event_id,
    }
}
