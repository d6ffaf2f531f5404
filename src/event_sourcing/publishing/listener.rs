use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::event_sourcing::core::{EventName, StoredEvent};
use crate::metrics::Metrics;

/// Which published events a listener wants to see.
#[derive(Clone)]
pub enum EventFilter {
    All,
    /// Aggregate type, compared case-insensitively (`user`).
    Aggregate(String),
    /// Exact topics (`authentication.events.user`).
    Topics(Vec<String>),
    Predicate(Arc<dyn Fn(&EventName) -> bool + Send + Sync>),
}

impl EventFilter {
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EventFilter::Topics(topics.into_iter().map(Into::into).collect())
    }

    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&EventName) -> bool + Send + Sync + 'static,
    {
        EventFilter::Predicate(Arc::new(predicate))
    }

    pub fn matches(&self, name: &EventName) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Aggregate(aggregate) => name.aggregate().eq_ignore_ascii_case(aggregate),
            EventFilter::Topics(topics) => {
                let topic = name.topic();
                topics.iter().any(|t| *t == topic)
            }
            EventFilter::Predicate(predicate) => predicate(name),
        }
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFilter::All => write!(f, "All"),
            EventFilter::Aggregate(aggregate) => write!(f, "Aggregate({aggregate})"),
            EventFilter::Topics(topics) => write!(f, "Topics({topics:?})"),
            EventFilter::Predicate(_) => write!(f, "Predicate"),
        }
    }
}

/// A live, filtered view on the publisher. No backlog: only events
/// published after the stream was created are delivered, in publish order.
pub struct EventStream {
    receiver: broadcast::Receiver<StoredEvent>,
    filter: EventFilter,
    missed: u64,
    metrics: Option<Arc<Metrics>>,
}

impl EventStream {
    pub(super) fn new(
        receiver: broadcast::Receiver<StoredEvent>,
        filter: EventFilter,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            receiver,
            filter,
            missed: 0,
            metrics,
        }
    }

    /// Next matching event, or `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<StoredEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event.name) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        missed = missed,
                        filter = ?self.filter,
                        "⚠️  Listener fell behind the publisher, oldest events dropped"
                    );
                    self.missed += missed;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_missed_events(missed);
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Events lost to lag since the last call. Non-zero means the consumer
    /// should catch up from durable storage.
    pub fn take_missed(&mut self) -> u64 {
        std::mem::take(&mut self.missed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::AggregateId;
    use crate::event_sourcing::publishing::DomainEventsPublisher;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn event(name: &str, sequence: u64) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::new_v4(),
            aggregate_id: AggregateId::from("a1"),
            version: sequence,
            name: EventName::parse(name).unwrap(),
            data: json!({}),
            inserted_at: Utc::now(),
            sequence,
        }
    }

    #[test]
    fn test_filters() {
        let user = EventName::parse("authentication.user:created").unwrap();
        let session = EventName::parse("authentication.session:signUpRequested").unwrap();

        assert!(EventFilter::All.matches(&user));
        assert!(EventFilter::Aggregate("User".into()).matches(&user));
        assert!(!EventFilter::Aggregate("user".into()).matches(&session));
        assert!(EventFilter::topics(["authentication.events.session"]).matches(&session));
        assert!(!EventFilter::topics(["authentication.events.session"]).matches(&user));
        assert!(EventFilter::predicate(|n| n.event().starts_with("sign")).matches(&session));
    }

    #[tokio::test]
    async fn test_listeners_receive_matching_events_in_order() {
        let publisher = DomainEventsPublisher::new(16);
        let listener = publisher.listener();
        let mut everything = listener.get_listener(EventFilter::All);
        let mut users = listener.get_listener(EventFilter::Aggregate("user".into()));

        publisher.publish(&[
            event("authentication.user:created", 1),
            event("authentication.session:signUpRequested", 2),
            event("authentication.user:emailChanged", 3),
        ]);

        let all: Vec<u64> = vec![
            everything.next().await.unwrap().sequence,
            everything.next().await.unwrap().sequence,
            everything.next().await.unwrap().sequence,
        ];
        assert_eq!(all, vec![1, 2, 3]);

        assert_eq!(users.next().await.unwrap().sequence, 1);
        assert_eq!(users.next().await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn test_no_backlog_for_late_listeners() {
        let publisher = DomainEventsPublisher::new(16);
        publisher.publish(&[event("authentication.user:created", 1)]);

        let mut late = publisher.listener().get_listener(EventFilter::All);
        publisher.publish(&[event("authentication.user:created", 2)]);

        assert_eq!(late.next().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_slow_listener_drops_oldest_and_reports_it() {
        let publisher = DomainEventsPublisher::new(2);
        let mut slow = publisher.listener().get_listener(EventFilter::All);

        let events: Vec<StoredEvent> = (1..=5).map(|s| event("authentication.user:created", s)).collect();
        publisher.publish(&events);

        let first = slow.next().await.unwrap();
        assert_eq!(first.sequence, 4);
        assert_eq!(slow.take_missed(), 3);
        assert_eq!(slow.take_missed(), 0);
        assert_eq!(slow.next().await.unwrap().sequence, 5);
    }

    #[tokio::test]
    async fn test_stream_ends_when_publisher_dropped() {
        let publisher = DomainEventsPublisher::new(4);
        let mut stream = publisher.listener().get_listener(EventFilter::All);
        drop(publisher);

        assert!(stream.next().await.is_none());
    }
}
