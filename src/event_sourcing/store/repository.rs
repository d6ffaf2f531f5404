use std::marker::PhantomData;
use std::sync::Arc;

use super::event_store::EventStore;
use super::snapshot_store::{SnapshotPolicy, SnapshotStore};
use crate::event_sourcing::core::{Aggregate, AggregateId, EventSourcingError, StoredEvent};
use crate::metrics::Metrics;

// ============================================================================
// Aggregate Repository
// ============================================================================
//
// Load = latest snapshot + the events after it.
// Save = drain pending events, append with the persisted version as the
//        expected version, then snapshot when the policy says so.
//
// ============================================================================

pub struct AggregateRepository<A: Aggregate> {
    events: Arc<dyn EventStore>,
    snapshots: Arc<dyn SnapshotStore>,
    policy: SnapshotPolicy,
    metrics: Option<Arc<Metrics>>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate> Clone for AggregateRepository<A> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            snapshots: self.snapshots.clone(),
            policy: self.policy,
            metrics: self.metrics.clone(),
            _aggregate: PhantomData,
        }
    }
}

impl<A: Aggregate> AggregateRepository<A> {
    pub fn new(
        events: Arc<dyn EventStore>,
        snapshots: Arc<dyn SnapshotStore>,
        policy: SnapshotPolicy,
    ) -> Self {
        Self {
            events,
            snapshots,
            policy,
            metrics: None,
            _aggregate: PhantomData,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    /// `None` when the aggregate has neither a snapshot nor events.
    pub async fn load(&self, id: &AggregateId) -> Result<Option<A>, EventSourcingError> {
        let snapshot = self.snapshots.get(id).await?;
        let after = snapshot.as_ref().map(|s| s.version);
        let events = self.events.get_events_for_aggregate(id, after).await?;

        if snapshot.is_none() && events.is_empty() {
            return Ok(None);
        }

        tracing::debug!(
            aggregate_id = %id,
            snapshot_version = ?after,
            replayed = events.len(),
            "Loaded aggregate"
        );
        A::build_from(&events, snapshot.as_ref()).map(Some)
    }

    /// Persist pending events. On a concurrency error the aggregate has
    /// already given up its events; reload before retrying.
    pub async fn save(&self, aggregate: &mut A) -> Result<Vec<StoredEvent>, EventSourcingError> {
        let expected_version = aggregate.persisted_version();
        let stream = aggregate.reset_events();
        if stream.is_empty() {
            return Ok(Vec::new());
        }

        let stored = self.events.store_events(&stream, expected_version).await?;
        if let Some(last) = stream.last_version() {
            aggregate.root_mut().mark_persisted(last);
        }

        // Events are committed; a failed snapshot only costs replay time later
        if let Err(e) = self.maybe_snapshot(aggregate).await {
            tracing::warn!(
                aggregate_id = %aggregate.aggregate_id(),
                error = %e,
                "Snapshot failed"
            );
        }

        Ok(stored)
    }

    async fn maybe_snapshot(&self, aggregate: &A) -> Result<(), EventSourcingError> {
        let existing = self.snapshots.get(aggregate.aggregate_id()).await?;
        if !self
            .policy
            .should_snapshot(aggregate.aggregate_version(), existing.as_ref())
        {
            return Ok(());
        }

        let snapshot = aggregate.snapshot()?;
        tracing::info!(
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
            "📸 Taking snapshot"
        );
        self.snapshots.store(snapshot).await?;

        if let Some(metrics) = &self.metrics {
            metrics.record_snapshot(A::handlers().aggregate_type());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::aggregate::tests::Counter;
    use crate::event_sourcing::publishing::DomainEventsPublisher;
    use crate::event_sourcing::store::{InMemoryEventStore, InMemorySnapshotStore};

    fn repository(interval: u64) -> (AggregateRepository<Counter>, Arc<InMemorySnapshotStore>) {
        let events = Arc::new(InMemoryEventStore::new("counter_events", DomainEventsPublisher::new(64)));
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        (
            AggregateRepository::new(events, snapshots.clone(), SnapshotPolicy::every(interval)),
            snapshots,
        )
    }

    #[tokio::test]
    async fn test_save_marks_persisted_and_load_round_trips() {
        let (repo, _) = repository(50);

        let mut counter = Counter::open("c1");
        counter.increment(5);
        repo.save(&mut counter).await.unwrap();
        assert_eq!(counter.persisted_version(), 2);

        counter.increment(1);
        repo.save(&mut counter).await.unwrap();
        assert_eq!(counter.persisted_version(), 3);

        let loaded = repo.load(&AggregateId::from("c1")).await.unwrap().unwrap();
        assert_eq!(loaded.total, 6);
        assert_eq!(loaded.aggregate_version(), 3);

        assert!(repo.load(&AggregateId::from("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_taken_past_interval_and_used_on_load() {
        let (repo, snapshots) = repository(3);

        let mut counter = Counter::open("c1");
        counter.increment(1);
        counter.increment(1);
        repo.save(&mut counter).await.unwrap();
        assert!(snapshots.get(&AggregateId::from("c1")).await.unwrap().is_none());

        counter.increment(1);
        repo.save(&mut counter).await.unwrap();
        let snapshot = snapshots.get(&AggregateId::from("c1")).await.unwrap().unwrap();
        assert_eq!(snapshot.version, 4);

        counter.increment(10);
        repo.save(&mut counter).await.unwrap();

        let loaded = repo.load(&AggregateId::from("c1")).await.unwrap().unwrap();
        assert_eq!(loaded.total, 13);
        assert_eq!(loaded.aggregate_version(), 5);
        assert_eq!(loaded.persisted_version(), 5);
    }

    #[tokio::test]
    async fn test_saving_nothing_is_noop() {
        let (repo, _) = repository(50);
        let mut counter = Counter::open("c1");
        repo.save(&mut counter).await.unwrap();

        let stored = repo.save(&mut counter).await.unwrap();
        assert!(stored.is_empty());
        assert_eq!(counter.persisted_version(), 1);
    }
}
