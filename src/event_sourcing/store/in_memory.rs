use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use super::event_store::{concurrency_conflict, stamp_events, EventStore};
use super::snapshot_store::SnapshotStore;
use crate::event_sourcing::core::{AggregateId, EventSourcingError, EventsStream, StoredEvent, StoredSnapshot};
use crate::event_sourcing::publishing::DomainEventsPublisher;
use crate::metrics::Metrics;

// ============================================================================
// In-Memory Stores
// ============================================================================
//
// Used by tests and by the demo binary when no database is configured.
// The whole append (check, write, publish) runs under one lock, which is
// the in-memory equivalent of the database transaction.
//
// ============================================================================

pub struct InMemoryEventStore {
    name: String,
    log: Mutex<Vec<StoredEvent>>,
    publisher: DomainEventsPublisher,
    metrics: Option<Arc<Metrics>>,
}

impl InMemoryEventStore {
    pub fn new(name: &str, publisher: DomainEventsPublisher) -> Self {
        Self {
            name: name.to_string(),
            log: Mutex::new(Vec::new()),
            publisher,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn len(&self) -> usize {
        self.log.lock().await.len()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: &AggregateId,
        after: Option<u64>,
    ) -> Result<Vec<StoredEvent>, EventSourcingError> {
        let after = after.unwrap_or(0);
        let log = self.log.lock().await;

        let mut events: Vec<StoredEvent> = log
            .iter()
            .filter(|e| &e.aggregate_id == aggregate_id && e.version > after)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn get_all_events(&self, after: u64) -> Result<Vec<StoredEvent>, EventSourcingError> {
        let log = self.log.lock().await;
        // The log is appended in sequence order
        let start = log.partition_point(|e| e.sequence <= after);
        Ok(log[start..].to_vec())
    }

    async fn store_events(
        &self,
        stream: &EventsStream,
        expected_version: u64,
    ) -> Result<Vec<StoredEvent>, EventSourcingError> {
        if stream.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let mut log = self.log.lock().await;

        let last = log
            .iter()
            .rev()
            .find(|e| &e.aggregate_id == stream.aggregate_id());
        if let Some(last) = last {
            if last.version != expected_version {
                let conflict = concurrency_conflict(
                    stream,
                    expected_version,
                    last.version,
                    last.sequence,
                    last.event_id,
                );
                tracing::warn!(
                    store = %self.name,
                    aggregate_id = %stream.aggregate_id(),
                    expected_version = expected_version,
                    last_version = last.version,
                    "Optimistic concurrency conflict"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_conflict(&self.name);
                }
                return Err(conflict.into());
            }
        }

        let next_sequence = log.last().map(|e| e.sequence).unwrap_or(0) + 1;
        let events = stamp_events(stream, next_sequence);
        log.extend(events.iter().cloned());

        // Still under the lock, so listeners see batches in sequence order
        self.publisher.publish(&events);
        drop(log);

        tracing::debug!(
            store = %self.name,
            aggregate_id = %stream.aggregate_id(),
            expected_version = expected_version,
            event_count = events.len(),
            "Appended events"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_append(&self.name, events.len(), started.elapsed().as_secs_f64());
        }

        Ok(events)
    }
}

#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<AggregateId, StoredSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get(&self, aggregate_id: &AggregateId) -> Result<Option<StoredSnapshot>, EventSourcingError> {
        Ok(self.snapshots.lock().await.get(aggregate_id).cloned())
    }

    async fn store(&self, snapshot: StoredSnapshot) -> Result<(), EventSourcingError> {
        let mut snapshots = self.snapshots.lock().await;
        let newer = snapshots
            .get(&snapshot.aggregate_id)
            .map_or(true, |existing| existing.version < snapshot.version);
        if newer {
            snapshots.insert(snapshot.aggregate_id.clone(), snapshot);
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
