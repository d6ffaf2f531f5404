use std::sync::Arc;
use tokio::sync::broadcast;

use super::listener::{EventFilter, EventStream};
use crate::event_sourcing::core::StoredEvent;
use crate::metrics::Metrics;

pub const DEFAULT_PUBLISHER_CAPACITY: usize = 1024;

/// In-process fan-out of committed events.
///
/// Backed by a bounded broadcast channel: `publish` never waits, and a
/// subscriber that falls more than `capacity` events behind loses the
/// oldest ones (see `EventStream::take_missed`).
#[derive(Clone)]
pub struct DomainEventsPublisher {
    sender: broadcast::Sender<StoredEvent>,
    metrics: Option<Arc<Metrics>>,
}

impl DomainEventsPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Push events to every current subscriber, in order. Only call this
    /// once the events are durably stored.
    pub fn publish(&self, events: &[StoredEvent]) {
        for event in events {
            // Err only means nobody is listening right now
            if self.sender.send(event.clone()).is_err() {
                tracing::trace!(event_id = %event.event_id, "No listeners for published event");
            }
        }
    }

    pub fn listener(&self) -> DomainEventsListener {
        DomainEventsListener {
            publisher: self.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn subscribe(&self) -> broadcast::Receiver<StoredEvent> {
        self.sender.subscribe()
    }
}

impl Default for DomainEventsPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_PUBLISHER_CAPACITY)
    }
}

/// Factory for filtered event streams.
#[derive(Clone)]
pub struct DomainEventsListener {
    publisher: DomainEventsPublisher,
}

impl DomainEventsListener {
    /// A new independent stream, starting at the moment of the call.
    pub fn get_listener(&self, filter: EventFilter) -> EventStream {
        EventStream::new(
            self.publisher.subscribe(),
            filter,
            self.publisher.metrics.clone(),
        )
    }
}
