use async_trait::async_trait;

use crate::event_sourcing::core::{AggregateId, EventSourcingError, StoredSnapshot};

/// Latest serialized state per aggregate.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, aggregate_id: &AggregateId) -> Result<Option<StoredSnapshot>, EventSourcingError>;

    /// Upsert; an older snapshot never replaces a newer one.
    async fn store(&self, snapshot: StoredSnapshot) -> Result<(), EventSourcingError>;
}

pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 50;

/// When to take a new snapshot after a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    interval: u64,
}

impl SnapshotPolicy {
    pub fn every(interval: u64) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// More than `interval` versions since the last snapshot (or since the
    /// start of the stream when there is none).
    pub fn should_snapshot(&self, aggregate_version: u64, existing: Option<&StoredSnapshot>) -> bool {
        let base = existing.map(|s| s.version).unwrap_or(0);
        aggregate_version.saturating_sub(base) > self.interval
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::every(DEFAULT_SNAPSHOT_INTERVAL)
    }
}
