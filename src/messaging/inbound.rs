use std::sync::Arc;

use crate::event_sourcing::core::StoredEvent;
use crate::event_sourcing::projections::EventHandlerTable;

#[derive(Debug, thiserror::Error)]
#[error("Notification handler for group {0} handles no events")]
pub struct NoHandledEvents(pub String);

/// Reacts to events published by other services. One consumer group per
/// handler; the topics it subscribes to follow from the handled names.
pub struct NotificationHandler<T> {
    consumer_group: String,
    target: Arc<T>,
    handlers: EventHandlerTable<T>,
}

impl<T: Send + Sync + 'static> NotificationHandler<T> {
    pub fn new(
        consumer_group: &str,
        target: Arc<T>,
        handlers: EventHandlerTable<T>,
    ) -> Result<Self, NoHandledEvents> {
        if handlers.event_names().next().is_none() {
            return Err(NoHandledEvents(consumer_group.to_string()));
        }
        Ok(Self {
            consumer_group: consumer_group.to_string(),
            target,
            handlers,
        })
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn topics(&self) -> Vec<String> {
        self.handlers.topics().into_iter().collect()
    }

    /// `Ok(false)` when the event has no handler here.
    pub async fn handle(&self, event: &StoredEvent) -> anyhow::Result<bool> {
        match self.handlers.dispatch(&self.target, event).await {
            Some(result) => result.map(|()| true),
            None => {
                tracing::debug!(
                    group = %self.consumer_group,
                    event_name = %event.name,
                    "No notification handler for event"
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::codec::tests::ticked;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct LastSequence(AtomicU64);

    impl LastSequence {
        async fn on_ticked(self: Arc<Self>, event: StoredEvent) -> anyhow::Result<()> {
            self.0.store(event.sequence, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatches_handled_events_only() {
        let target = Arc::new(LastSequence::default());
        let handlers = EventHandlerTable::new()
            .on("testing.counter:ticked", LastSequence::on_ticked)
            .unwrap();
        let handler = NotificationHandler::new("counter.inbound.listeners", target.clone(), handlers).unwrap();

        assert_eq!(handler.topics(), vec!["testing.events.counter".to_string()]);
        assert!(handler.handle(&ticked(9)).await.unwrap());
        assert_eq!(target.0.load(Ordering::SeqCst), 9);

        let mut other = ticked(10);
        other.name = "testing.counter:reset".parse().unwrap();
        assert!(!handler.handle(&other).await.unwrap());
        assert_eq!(target.0.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_requires_at_least_one_handler() {
        let result = NotificationHandler::new("empty", Arc::new(LastSequence::default()), EventHandlerTable::new());
        assert!(result.is_err());
    }
}
