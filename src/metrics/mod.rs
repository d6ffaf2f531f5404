mod server;

pub use server::start_metrics_server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Provides metrics for:
// - Event store appends, conflicts and snapshots
// - Listener lag on the in-process publisher
// - Projector outcomes and offsets
// - Notification bridge traffic (published, failed, received, dropped)
// - Command retries at the RPC boundary
//
// Components take an optional `Arc<Metrics>`; without one they stay silent.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Event Store Metrics
    pub events_stored: IntCounterVec,
    pub concurrency_conflicts: IntCounterVec,
    pub append_duration: HistogramVec,
    pub snapshots_taken: IntCounterVec,

    // Publisher Metrics
    pub listener_missed_events: IntCounter,

    // Projection Metrics
    pub projector_events: IntCounterVec,
    pub projector_offset: IntGaugeVec,

    // Notification Metrics
    pub notifications_published: IntCounterVec,
    pub notifications_failed: IntCounterVec,
    pub notifications_received: IntCounterVec,
    pub notifications_dropped: IntCounterVec,

    // RPC Metrics
    pub command_retries: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Event Store Metrics
        let events_stored = IntCounterVec::new(
            Opts::new("events_stored_total", "Total events appended to an event store"),
            &["store"],
        )?;
        registry.register(Box::new(events_stored.clone()))?;

        let concurrency_conflicts = IntCounterVec::new(
            Opts::new(
                "optimistic_concurrency_conflicts_total",
                "Appends rejected because the expected version was stale",
            ),
            &["store"],
        )?;
        registry.register(Box::new(concurrency_conflicts.clone()))?;

        let append_duration = HistogramVec::new(
            HistogramOpts::new("event_store_append_duration_seconds", "Event store append duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["store"],
        )?;
        registry.register(Box::new(append_duration.clone()))?;

        let snapshots_taken = IntCounterVec::new(
            Opts::new("snapshots_taken_total", "Aggregate snapshots written"),
            &["aggregate"],
        )?;
        registry.register(Box::new(snapshots_taken.clone()))?;

        // Publisher Metrics
        let listener_missed_events = IntCounter::new(
            "listener_missed_events_total",
            "Events dropped for listeners that fell behind the publisher",
        )?;
        registry.register(Box::new(listener_missed_events.clone()))?;

        // Projection Metrics
        let projector_events = IntCounterVec::new(
            Opts::new("projector_events_total", "Projector apply outcomes"),
            &["group", "topic", "outcome"],
        )?;
        registry.register(Box::new(projector_events.clone()))?;

        let projector_offset = IntGaugeVec::new(
            Opts::new("projector_offset", "Last projected sequence per group and topic"),
            &["group", "topic"],
        )?;
        registry.register(Box::new(projector_offset.clone()))?;

        // Notification Metrics
        let notifications_published = IntCounterVec::new(
            Opts::new("notifications_published_total", "Notifications delivered to the broker"),
            &["topic"],
        )?;
        registry.register(Box::new(notifications_published.clone()))?;

        let notifications_failed = IntCounterVec::new(
            Opts::new("notifications_failed_total", "Notifications that could not be published"),
            &["topic", "reason"],
        )?;
        registry.register(Box::new(notifications_failed.clone()))?;

        let notifications_received = IntCounterVec::new(
            Opts::new("notifications_received_total", "Notifications decoded from the broker"),
            &["topic"],
        )?;
        registry.register(Box::new(notifications_received.clone()))?;

        let notifications_dropped = IntCounterVec::new(
            Opts::new("notifications_dropped_total", "Inbound notifications dropped as undecodable"),
            &["topic", "reason"],
        )?;
        registry.register(Box::new(notifications_dropped.clone()))?;

        // RPC Metrics
        let command_retries = IntCounterVec::new(
            Opts::new("command_retries_total", "Commands retried after a concurrency conflict"),
            &["operation"],
        )?;
        registry.register(Box::new(command_retries.clone()))?;

        Ok(Self {
            registry,
            events_stored,
            concurrency_conflicts,
            append_duration,
            snapshots_taken,
            listener_missed_events,
            projector_events,
            projector_offset,
            notifications_published,
            notifications_failed,
            notifications_received,
            notifications_dropped,
            command_retries,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_append(&self, store: &str, events: usize, duration_secs: f64) {
        self.events_stored.with_label_values(&[store]).inc_by(events as u64);
        self.append_duration.with_label_values(&[store]).observe(duration_secs);
    }

    pub fn record_conflict(&self, store: &str) {
        self.concurrency_conflicts.with_label_values(&[store]).inc();
    }

    pub fn record_snapshot(&self, aggregate: &str) {
        self.snapshots_taken.with_label_values(&[aggregate]).inc();
    }

    pub fn record_missed_events(&self, missed: u64) {
        self.listener_missed_events.inc_by(missed);
    }

    /// `outcome` is one of `applied`, `rejected`, `failed`.
    pub fn record_projection(&self, group: &str, topic: &str, outcome: &str) {
        self.projector_events.with_label_values(&[group, topic, outcome]).inc();
    }

    pub fn set_projector_offset(&self, group: &str, topic: &str, offset: u64) {
        self.projector_offset.with_label_values(&[group, topic]).set(offset as i64);
    }

    pub fn record_notification_published(&self, topic: &str) {
        self.notifications_published.with_label_values(&[topic]).inc();
    }

    pub fn record_notification_failed(&self, topic: &str, reason: &str) {
        self.notifications_failed.with_label_values(&[topic, reason]).inc();
    }

    pub fn record_notification_received(&self, topic: &str) {
        self.notifications_received.with_label_values(&[topic]).inc();
    }

    pub fn record_notification_dropped(&self, topic: &str, reason: &str) {
        self.notifications_dropped.with_label_values(&[topic, reason]).inc();
    }

    pub fn record_command_retry(&self, operation: &str) {
        self.command_retries.with_label_values(&[operation]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_missed_events(0);
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_record_append() {
        let metrics = Metrics::new().unwrap();
        metrics.record_append("user_events", 3, 0.002);
        metrics.record_append("user_events", 1, 0.001);

        let gathered = metrics.registry.gather();
        let stored = gathered.iter().find(|m| m.name() == "events_stored_total").unwrap();
        assert_eq!(stored.metric[0].counter.value, Some(4.0));
    }

    #[test]
    fn test_record_projection_outcomes() {
        let metrics = Metrics::new().unwrap();
        metrics.record_projection("user_view", "authentication.events.user", "applied");
        metrics.record_projection("user_view", "authentication.events.user", "rejected");
        metrics.set_projector_offset("user_view", "authentication.events.user", 7);

        let gathered = metrics.registry.gather();
        let outcomes = gathered.iter().find(|m| m.name() == "projector_events_total").unwrap();
        assert_eq!(outcomes.metric.len(), 2); // Two different outcome labels

        let offset = gathered.iter().find(|m| m.name() == "projector_offset").unwrap();
        assert_eq!(offset.metric[0].gauge.value, Some(7.0));
    }

    #[test]
    fn test_record_notifications() {
        let metrics = Metrics::new().unwrap();
        metrics.record_notification_published("authentication.events.user");
        metrics.record_notification_failed("authentication.events.user", "connect");
        metrics.record_notification_dropped("authentication.events.user", "decode");

        let gathered = metrics.registry.gather();
        let failed = gathered.iter().find(|m| m.name() == "notifications_failed_total").unwrap();
        assert_eq!(failed.metric[0].counter.value, Some(1.0));
    }
}
