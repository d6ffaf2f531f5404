use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::event_sourcing::core::StoredEvent;
use crate::event_sourcing::projections::Projector;
use crate::event_sourcing::publishing::{DomainEventsListener, EventFilter, EventStream};
use crate::messaging::{NotificationConsumer, NotificationHandler, NotificationProducer, NotificationStream};

// ============================================================================
// Daemons - long-running loops around the event sourcing core
// ============================================================================
//
// ProjectionDaemon:      listener -> Projector::apply, replay on gaps or lag
// OutboundNotifications: listener -> NotificationProducer (best effort)
// InboundNotifications:  NotificationConsumer -> NotificationHandler -> ack
//
// Each loop is a spawned task stopped through a watch channel. A DaemonSet
// starts daemons in order and stops them in reverse.
//
// ============================================================================

#[async_trait]
pub trait Daemon: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self);
}

struct Task {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Task {
    async fn stop(self, daemon: &str) {
        // Err means the loop already ended on its own
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(daemon = %daemon, error = %e, "Daemon task failed");
        }
    }
}

/// Slot for the running task of a daemon; a daemon runs at most once.
#[derive(Default)]
struct TaskSlot(Mutex<Option<Task>>);

impl TaskSlot {
    async fn spawn<F, Fut>(&self, daemon: &str, run: F) -> anyhow::Result<()>
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.0.lock().await;
        if slot.is_some() {
            anyhow::bail!("daemon {daemon} is already running");
        }

        let (shutdown, receiver) = watch::channel(false);
        let handle = tokio::spawn(run(receiver));
        *slot = Some(Task { shutdown, handle });
        Ok(())
    }

    async fn stop(&self, daemon: &str) {
        let task = self.0.lock().await.take();
        if let Some(task) = task {
            task.stop(daemon).await;
        }
    }
}

// ============================================================================
// Projection
// ============================================================================

pub struct ProjectionDaemon<P> {
    name: String,
    projector: Arc<Projector<P>>,
    listener: DomainEventsListener,
    task: TaskSlot,
}

impl<P: Send + Sync + 'static> ProjectionDaemon<P> {
    pub fn new(projector: Arc<Projector<P>>, listener: DomainEventsListener) -> Self {
        Self {
            name: format!("projection-{}", projector.group_id()),
            projector,
            listener,
            task: TaskSlot::default(),
        }
    }

    async fn catch_up(projector: &Projector<P>) {
        if let Err(e) = projector.replay().await {
            tracing::error!(group = %projector.group_id(), error = %e, "Projection replay failed");
        }
    }

    async fn run(projector: Arc<Projector<P>>, mut events: EventStream, mut shutdown: watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = events.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let applied = match projector.apply(&event).await {
                Ok(applied) => applied,
                Err(e) => {
                    // Offset did not move; the next gap triggers a replay from here
                    tracing::error!(group = %projector.group_id(), error = %e, "Projection failed");
                    continue;
                }
            };

            let missed = events.take_missed();
            if !applied || missed > 0 {
                tracing::debug!(
                    group = %projector.group_id(),
                    sequence = event.sequence,
                    missed = missed,
                    "Listener out of step, replaying from store"
                );
                Self::catch_up(&projector).await;
            }
        }

        tracing::info!(group = %projector.group_id(), "Projection daemon stopped");
    }
}

#[async_trait]
impl<P: Send + Sync + 'static> Daemon for ProjectionDaemon<P> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.projector.validate()?;

        // Subscribe before replaying so nothing committed in between is lost
        let topics: Vec<String> = self.projector.topics().iter().cloned().collect();
        let events = self.listener.get_listener(EventFilter::topics(topics));
        let caught_up = self.projector.replay().await?;

        tracing::info!(
            daemon = %self.name,
            replayed = caught_up,
            topics = ?self.projector.topics(),
            "🚀 Projection daemon started"
        );

        let projector = self.projector.clone();
        self.task
            .spawn(&self.name, move |shutdown| Self::run(projector, events, shutdown))
            .await
    }

    async fn stop(&self) {
        self.task.stop(&self.name).await;
    }
}

// ============================================================================
// Outbound notifications
// ============================================================================

pub struct OutboundNotifications {
    producer: Arc<dyn NotificationProducer>,
    listener: DomainEventsListener,
    task: TaskSlot,
}

impl OutboundNotifications {
    pub fn new(producer: Arc<dyn NotificationProducer>, listener: DomainEventsListener) -> Self {
        Self {
            producer,
            listener,
            task: TaskSlot::default(),
        }
    }

    async fn run(
        producer: Arc<dyn NotificationProducer>,
        mut events: EventStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event: StoredEvent = tokio::select! {
                _ = shutdown.changed() => break,
                event = events.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            producer.publish_notifications(&event.topic(), &[event]).await;
        }
    }
}

#[async_trait]
impl Daemon for OutboundNotifications {
    fn name(&self) -> &str {
        "outbound-notifications"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let events = self.listener.get_listener(EventFilter::All);
        let producer = self.producer.clone();
        self.task
            .spawn(self.name(), move |shutdown| Self::run(producer, events, shutdown))
            .await
    }

    async fn stop(&self) {
        self.task.stop(self.name()).await;
        if !self.producer.disconnect().await {
            tracing::warn!("Notification producer did not disconnect cleanly");
        }
    }
}

// ============================================================================
// Inbound notifications
// ============================================================================

pub struct InboundNotifications<T> {
    consumer: Arc<dyn NotificationConsumer>,
    handler: Arc<NotificationHandler<T>>,
    task: TaskSlot,
}

impl<T: Send + Sync + 'static> InboundNotifications<T> {
    pub fn new(consumer: Arc<dyn NotificationConsumer>, handler: Arc<NotificationHandler<T>>) -> Self {
        Self {
            consumer,
            handler,
            task: TaskSlot::default(),
        }
    }

    async fn run(
        handler: Arc<NotificationHandler<T>>,
        mut notifications: NotificationStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                delivery = notifications.next() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            // Handled (or failed and logged) before the offset is released
            let event = &delivery.event;
            if let Err(e) = handler.handle(event).await {
                tracing::error!(
                    group = %handler.consumer_group(),
                    event_name = %event.name,
                    event_id = %event.event_id,
                    error = %e,
                    "Inbound notification handler failed"
                );
            }
            delivery.ack();
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Daemon for InboundNotifications<T> {
    fn name(&self) -> &str {
        "inbound-notifications"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let topics = self.handler.topics();
        let notifications = self
            .consumer
            .get_listener(&topics, self.handler.consumer_group())
            .await?;

        tracing::debug!(
            group = %self.handler.consumer_group(),
            topics = ?topics,
            "Listening for inbound notifications"
        );

        let handler = self.handler.clone();
        self.task
            .spawn(self.name(), move |shutdown| Self::run(handler, notifications, shutdown))
            .await
    }

    /// The handler finishes and acknowledges its current event before the
    /// consumer commits and leaves the group.
    async fn stop(&self) {
        self.task.stop(self.name()).await;
        if !self.consumer.disconnect().await {
            tracing::warn!("Notification consumer did not disconnect cleanly");
        }
    }
}

// ============================================================================
// Daemon set
// ============================================================================

#[derive(Default)]
pub struct DaemonSet {
    daemons: Vec<Arc<dyn Daemon>>,
    started: Mutex<usize>,
}

impl DaemonSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, daemon: Arc<dyn Daemon>) -> Self {
        self.daemons.push(daemon);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.daemons.iter().map(|d| d.name()).collect()
    }

    /// Start in registration order. On failure the ones already started are
    /// stopped again.
    pub async fn start_all(&self) -> anyhow::Result<()> {
        let mut started = self.started.lock().await;

        for daemon in &self.daemons[*started..] {
            if let Err(e) = daemon.start().await {
                tracing::error!(daemon = %daemon.name(), error = %e, "Daemon failed to start");
                for running in self.daemons[..*started].iter().rev() {
                    running.stop().await;
                }
                *started = 0;
                return Err(e.context(format!("starting daemon {}", daemon.name())));
            }
            tracing::info!(daemon = %daemon.name(), "Daemon started");
            *started += 1;
        }

        Ok(())
    }

    /// Stop in reverse order.
    pub async fn stop_all(&self) {
        let mut started = self.started.lock().await;

        for daemon in self.daemons[..*started].iter().rev() {
            daemon.stop().await;
            tracing::info!(daemon = %daemon.name(), "Daemon stopped");
        }
        *started = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::aggregate::tests::Counter;
    use crate::event_sourcing::core::Aggregate;
    use crate::event_sourcing::projections::{EventHandlerTable, InMemoryOffsetStore, OffsetStore};
    use crate::event_sourcing::publishing::DomainEventsPublisher;
    use crate::event_sourcing::store::{
        AggregateRepository, EventStore, InMemoryEventStore, InMemorySnapshotStore, SnapshotPolicy,
    };
    use crate::messaging::codec::tests::ticked;
    use crate::messaging::{Delivery, MessagingError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot, Semaphore};

    const TOPIC: &str = "testing.events.counter";

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[derive(Default)]
    struct Tally {
        total: Mutex<i64>,
    }

    impl Tally {
        async fn on_incremented(self: Arc<Self>, event: StoredEvent) -> anyhow::Result<()> {
            *self.total.lock().await += event.data["by"].as_i64().unwrap_or(0);
            Ok(())
        }
    }

    fn tally_projector(store: Arc<dyn EventStore>, offsets: Arc<InMemoryOffsetStore>) -> Arc<Projector<Tally>> {
        let handlers = EventHandlerTable::new()
            .on("testing.counter:incremented", Tally::on_incremented)
            .unwrap();
        Arc::new(Projector::new("tally", Arc::new(Tally::default()), handlers, offsets).with_source(TOPIC, store))
    }

    #[tokio::test]
    async fn test_projection_daemon_replays_then_follows() {
        let publisher = DomainEventsPublisher::new(64);
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new("counter_events", publisher.clone()));

        let mut counter = Counter::open("c1");
        counter.increment(2);
        store.store_events(&counter.reset_events(), 0).await.unwrap();

        let offsets = Arc::new(InMemoryOffsetStore::new());
        let projector = tally_projector(store.clone(), offsets.clone());
        let daemon = ProjectionDaemon::new(projector.clone(), publisher.listener());
        daemon.start().await.unwrap();
        assert_eq!(offsets.get_offset("tally", TOPIC).await.unwrap(), 2);

        counter.increment(5);
        store.store_events(&counter.reset_events(), 2).await.unwrap();

        eventually(|| async { offsets.get_offset("tally", TOPIC).await.unwrap() == 3 }).await;
        assert_eq!(*projector.projection().total.lock().await, 7);

        daemon.stop().await;
    }

    #[tokio::test]
    async fn test_projection_daemon_recovers_from_gap() {
        // Store publishes somewhere the daemon does not listen
        let silent = DomainEventsPublisher::new(64);
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new("counter_events", silent));
        let live = DomainEventsPublisher::new(64);

        let offsets = Arc::new(InMemoryOffsetStore::new());
        let projector = tally_projector(store.clone(), offsets.clone());
        let daemon = ProjectionDaemon::new(projector.clone(), live.listener());
        daemon.start().await.unwrap();

        let mut counter = Counter::open("c1");
        counter.increment(1);
        counter.increment(1);
        let stored = store.store_events(&counter.reset_events(), 0).await.unwrap();

        // Only the last event reaches the listener: a gap, so the daemon replays
        live.publish(&stored[2..]);

        eventually(|| async { offsets.get_offset("tally", TOPIC).await.unwrap() == 3 }).await;
        assert_eq!(*projector.projection().total.lock().await, 2);

        daemon.stop().await;
    }

    struct UnreachableBroker {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl NotificationProducer for UnreachableBroker {
        async fn publish_notifications(&self, topic: &str, events: &[StoredEvent]) {
            self.attempts.fetch_add(events.len(), Ordering::SeqCst);
            tracing::warn!(topic = %topic, "Broker unreachable, notification lost");
        }

        fn is_connected(&self) -> bool {
            false
        }

        async fn disconnect(&self) -> bool {
            true
        }
    }

    // Known gap: nothing retries the lost notification
    #[tokio::test]
    async fn test_publish_failure_does_not_fail_command() {
        let publisher = DomainEventsPublisher::new(64);
        let store = Arc::new(InMemoryEventStore::new("counter_events", publisher.clone()));
        let repository: AggregateRepository<Counter> = AggregateRepository::new(
            store.clone(),
            Arc::new(InMemorySnapshotStore::new()),
            SnapshotPolicy::default(),
        );

        let broker = Arc::new(UnreachableBroker {
            attempts: AtomicUsize::new(0),
        });
        let outbound = OutboundNotifications::new(broker.clone(), publisher.listener());
        outbound.start().await.unwrap();

        let mut counter = Counter::open("c1");
        let stored = repository.save(&mut counter).await.unwrap();

        assert_eq!(stored.len(), 1);
        assert_eq!(store.len().await, 1);
        eventually(|| async { broker.attempts.load(Ordering::SeqCst) == 1 }).await;

        outbound.stop().await;
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl Daemon for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn start(&self) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("cannot start");
            }
            self.log.lock().await.push(format!("start {}", self.name));
            Ok(())
        }

        async fn stop(&self) {
            self.log.lock().await.push(format!("stop {}", self.name));
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> Arc<dyn Daemon> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            fail,
        })
    }

    #[tokio::test]
    async fn test_daemon_set_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let set = DaemonSet::new()
            .with(recorder("a", &log, false))
            .with(recorder("b", &log, false));

        set.start_all().await.unwrap();
        set.stop_all().await;

        assert_eq!(*log.lock().await, vec!["start a", "start b", "stop b", "stop a"]);
    }

    #[tokio::test]
    async fn test_daemon_set_rolls_back_on_start_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let set = DaemonSet::new()
            .with(recorder("a", &log, false))
            .with(recorder("b", &log, true));

        assert!(set.start_all().await.is_err());
        set.stop_all().await;

        assert_eq!(*log.lock().await, vec!["start a", "stop a"]);
    }

    // ------------------------------------------------------------------
    // Inbound acknowledgements
    // ------------------------------------------------------------------

    struct ScriptedConsumer {
        stream: Mutex<Option<NotificationStream>>,
        handled_at_disconnect: Arc<AtomicUsize>,
        handled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NotificationConsumer for ScriptedConsumer {
        async fn get_listener(
            &self,
            _topics: &[String],
            _consumer_group: &str,
        ) -> Result<NotificationStream, MessagingError> {
            self.stream.lock().await.take().ok_or(MessagingError::AlreadySubscribed)
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn disconnect(&self) -> bool {
            self.handled_at_disconnect
                .store(self.handled.load(Ordering::SeqCst), Ordering::SeqCst);
            true
        }
    }

    struct Gated {
        gate: Semaphore,
        entered: AtomicUsize,
        handled: Arc<AtomicUsize>,
    }

    impl Gated {
        async fn on_ticked(self: Arc<Self>, _event: StoredEvent) -> anyhow::Result<()> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await?.forget();
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct InboundFixture {
        daemon: Arc<InboundNotifications<Gated>>,
        target: Arc<Gated>,
        deliveries: mpsc::Sender<Delivery>,
        handled_at_disconnect: Arc<AtomicUsize>,
    }

    fn inbound() -> InboundFixture {
        let (deliveries, receiver) = mpsc::channel(1);
        let handled = Arc::new(AtomicUsize::new(0));
        let handled_at_disconnect = Arc::new(AtomicUsize::new(usize::MAX));

        let consumer = Arc::new(ScriptedConsumer {
            stream: Mutex::new(Some(NotificationStream::new(receiver))),
            handled_at_disconnect: handled_at_disconnect.clone(),
            handled: handled.clone(),
        });
        let target = Arc::new(Gated {
            gate: Semaphore::new(0),
            entered: AtomicUsize::new(0),
            handled,
        });
        let handlers = EventHandlerTable::new()
            .on("testing.counter:ticked", Gated::on_ticked)
            .unwrap();
        let handler = Arc::new(NotificationHandler::new("gated", target.clone(), handlers).unwrap());

        InboundFixture {
            daemon: Arc::new(InboundNotifications::new(consumer, handler)),
            target,
            deliveries,
            handled_at_disconnect,
        }
    }

    #[tokio::test]
    async fn test_inbound_ack_follows_handling() {
        let f = inbound();
        f.daemon.start().await.unwrap();

        let (delivery, mut acked) = Delivery::new(ticked(1));
        f.deliveries.send(delivery).await.unwrap();

        eventually(|| async { f.target.entered.load(Ordering::SeqCst) == 1 }).await;
        assert!(matches!(acked.try_recv(), Err(oneshot::error::TryRecvError::Empty)));

        f.target.gate.add_permits(1);
        assert!(acked.await.is_ok());
        assert_eq!(f.target.handled.load(Ordering::SeqCst), 1);

        f.daemon.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_stop_finishes_in_flight_and_leaves_the_rest() {
        let f = inbound();
        f.daemon.start().await.unwrap();

        let (first, first_acked) = Delivery::new(ticked(1));
        let (second, second_acked) = Delivery::new(ticked(2));
        f.deliveries.send(first).await.unwrap();
        eventually(|| async { f.target.entered.load(Ordering::SeqCst) == 1 }).await;
        f.deliveries.send(second).await.unwrap();

        let daemon = f.daemon.clone();
        let stopping = tokio::spawn(async move { daemon.stop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.target.gate.add_permits(1);
        stopping.await.unwrap();

        assert!(first_acked.await.is_ok());
        // Never handled, so never acknowledged: the broker redelivers it
        assert!(second_acked.await.is_err());
        assert_eq!(f.target.handled.load(Ordering::SeqCst), 1);
        // The consumer left only after the in-flight event was handled
        assert_eq!(f.handled_at_disconnect.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reordered_live_events_are_projected_once() {
        // Two writers can publish in the opposite order of their sequences
        let silent = DomainEventsPublisher::new(64);
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new("counter_events", silent));
        let live = DomainEventsPublisher::new(64);

        let offsets = Arc::new(InMemoryOffsetStore::new());
        let projector = tally_projector(store.clone(), offsets.clone());
        let daemon = ProjectionDaemon::new(projector.clone(), live.listener());
        daemon.start().await.unwrap();

        let mut first = Counter::open("c1");
        first.increment(3);
        let first = store.store_events(&first.reset_events(), 0).await.unwrap();
        let mut second = Counter::open("c2");
        second.increment(4);
        let second = store.store_events(&second.reset_events(), 0).await.unwrap();

        live.publish(&second);
        live.publish(&first);

        eventually(|| async { offsets.get_offset("tally", TOPIC).await.unwrap() == 4 }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*projector.projection().total.lock().await, 7);

        daemon.stop().await;
    }
}
