use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::handlers::EventHandlerTable;
use super::offset_store::OffsetStore;
use crate::errors::{ErrorCategory, ServiceError};
use crate::event_sourcing::core::{EventSourcingError, StoredEvent};
use crate::event_sourcing::store::EventStore;
use crate::metrics::Metrics;

// ============================================================================
// Projector - ordered, gapless read-model builder
// ============================================================================
//
// Per (group, topic) state machine:
//   offset starts at 0
//   apply(e): e.sequence == offset + 1  -> handle, offset = e.sequence
//             anything else             -> reject, offset unchanged
//
// Handler failures propagate and leave the offset where it was, so the
// next replay starts from the failed event again.
//
// `apply` is not safe to call concurrently for one group; drive it from a
// single loop (see `daemons::ProjectionDaemon`).
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Store(#[from] EventSourcingError),

    #[error("Offset store error: {0}")]
    Offsets(#[from] sqlx::Error),

    #[error("Projection of {event_name} (sequence {sequence}) failed: {source}")]
    Handler {
        event_name: String,
        sequence: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("No event source registered for topic {0}")]
    UnknownTopic(String),
}

impl ServiceError for ProjectionError {
    fn category(&self) -> ErrorCategory {
        match self {
            ProjectionError::Store(e) => e.category(),
            ProjectionError::Offsets(_) => ErrorCategory::Unavailable,
            ProjectionError::Handler { .. } | ProjectionError::UnknownTopic(_) => ErrorCategory::Internal,
        }
    }
}

pub struct Projector<P> {
    group_id: String,
    projection: Arc<P>,
    handlers: EventHandlerTable<P>,
    topics: BTreeSet<String>,
    offsets: Arc<dyn OffsetStore>,
    sources: HashMap<String, Arc<dyn EventStore>>,
    metrics: Option<Arc<Metrics>>,
}

impl<P: Send + Sync + 'static> Projector<P> {
    pub fn new(
        group_id: &str,
        projection: Arc<P>,
        handlers: EventHandlerTable<P>,
        offsets: Arc<dyn OffsetStore>,
    ) -> Self {
        let topics = handlers.topics();
        Self {
            group_id: group_id.to_string(),
            projection,
            handlers,
            topics,
            offsets,
            sources: HashMap::new(),
            metrics: None,
        }
    }

    /// Durable log to replay `topic` from.
    pub fn with_source(mut self, topic: &str, store: Arc<dyn EventStore>) -> Self {
        self.sources.insert(topic.to_string(), store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Every handled topic must have a source to catch up from.
    pub fn validate(&self) -> Result<(), ProjectionError> {
        match self.topics.iter().find(|t| !self.sources.contains_key(*t)) {
            Some(topic) => Err(ProjectionError::UnknownTopic(topic.clone())),
            None => Ok(()),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn topics(&self) -> &BTreeSet<String> {
        &self.topics
    }

    pub fn projection(&self) -> &Arc<P> {
        &self.projection
    }

    pub async fn offset(&self, topic: &str) -> Result<u64, ProjectionError> {
        self.offsets.get_offset(&self.group_id, topic).await
    }

    /// Stored events of `topic` with `sequence > after`.
    pub async fn get_events(&self, after: u64, topic: &str) -> Result<Vec<StoredEvent>, ProjectionError> {
        let store = self
            .sources
            .get(topic)
            .ok_or_else(|| ProjectionError::UnknownTopic(topic.to_string()))?;

        let events = store.get_all_events(after).await?;
        Ok(events.into_iter().filter(|e| e.topic() == topic).collect())
    }

    /// `Ok(true)` when the event was projected and the offset advanced.
    pub async fn apply(&self, event: &StoredEvent) -> Result<bool, ProjectionError> {
        let topic = event.topic();
        if !self.topics.contains(&topic) {
            tracing::trace!(group = %self.group_id, topic = %topic, "Topic not projected by this group");
            return Ok(false);
        }

        let offset = self.offsets.get_offset(&self.group_id, &topic).await?;
        if event.sequence != offset + 1 {
            tracing::warn!(
                group = %self.group_id,
                topic = %topic,
                offset = offset,
                sequence = event.sequence,
                event_id = %event.event_id,
                "Projection rejected out-of-order event"
            );
            self.record(&topic, "rejected");
            return Ok(false);
        }

        match self.handlers.dispatch(&self.projection, event).await {
            Some(Err(source)) => {
                tracing::error!(
                    group = %self.group_id,
                    event_name = %event.name,
                    sequence = event.sequence,
                    error = %source,
                    "❌ Projection handler failed"
                );
                self.record(&topic, "failed");
                return Err(ProjectionError::Handler {
                    event_name: event.name.to_string(),
                    sequence: event.sequence,
                    source,
                });
            }
            Some(Ok(())) => {}
            None => {
                tracing::debug!(group = %self.group_id, event_name = %event.name, "No projection handler, skipping");
            }
        }

        self.offsets.set_offset(&self.group_id, &topic, event.sequence).await?;
        self.record(&topic, "applied");
        if let Some(metrics) = &self.metrics {
            metrics.set_projector_offset(&self.group_id, &topic, event.sequence);
        }

        Ok(true)
    }

    /// Catch every topic up from durable storage. Returns how many events
    /// were applied; calling it again once caught up does nothing.
    pub async fn replay(&self) -> Result<usize, ProjectionError> {
        let mut applied = 0;

        for topic in &self.topics {
            let offset = self.offset(topic).await?;
            let events = self.get_events(offset, topic).await?;

            for event in &events {
                if !self.apply(event).await? {
                    // Gap in the stored log; wait for the missing event
                    break;
                }
                applied += 1;
            }
        }

        if applied > 0 {
            tracing::info!(group = %self.group_id, applied = applied, "🔁 Projection replay caught up");
        }
        Ok(applied)
    }

    fn record(&self, topic: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_projection(&self.group_id, topic, outcome);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
