use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::Headers;
use rdkafka::{Message, Offset, TopicPartitionList};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use super::codec::{CodecRegistry, MessagingError};
use super::producer::EVENT_HEADER;
use crate::config::KafkaConfig;
use crate::event_sourcing::core::{EventName, StoredEvent};
use crate::metrics::Metrics;

// ============================================================================
// Notification Consumer - broker messages back into StoredEvents
// ============================================================================
//
// One spawned loop per consumer instance:
//   recv -> read eventName header -> decode via registry -> deliver
//        -> wait for ack -> commit
//
// A broker offset is committed only once its event has been acknowledged,
// so anything unhandled at a crash or shutdown is redelivered. One delivery
// is in flight at a time, which keeps commits in partition order.
// Undecodable messages are logged, counted and committed past; they are
// never redelivered.
//
// ============================================================================

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// One inbound event. Its offset is committed after `ack`; dropping it
/// unacknowledged leaves the offset for redelivery.
pub struct Delivery {
    pub event: StoredEvent,
    ack: oneshot::Sender<()>,
}

impl Delivery {
    pub fn new(event: StoredEvent) -> (Self, oneshot::Receiver<()>) {
        let (ack, acked) = oneshot::channel();
        (Self { event, ack }, acked)
    }

    pub fn ack(self) {
        // Err means the consumer already stopped; the event is redelivered
        let _ = self.ack.send(());
    }
}

/// Decoded inbound events, in broker order per partition.
pub struct NotificationStream {
    receiver: mpsc::Receiver<Delivery>,
}

impl NotificationStream {
    pub fn new(receiver: mpsc::Receiver<Delivery>) -> Self {
        Self { receiver }
    }

    /// `None` once the consumer has stopped.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait NotificationConsumer: Send + Sync {
    /// Join `consumer_group` and stream decoded events from `topics`.
    /// A consumer can only be subscribed once.
    async fn get_listener(
        &self,
        topics: &[String],
        consumer_group: &str,
    ) -> Result<NotificationStream, MessagingError>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> bool;
}

/// Decode one broker message. The event name comes from the header, the
/// rest from the codec registered for its topic.
pub fn decode_notification<H: Headers>(
    registry: &CodecRegistry,
    headers: Option<&H>,
    payload: Option<&[u8]>,
) -> Result<StoredEvent, MessagingError> {
    let header = headers
        .and_then(|headers| headers.iter().find(|h| h.key == EVENT_HEADER))
        .and_then(|h| h.value)
        .ok_or_else(|| MessagingError::Malformed(format!("missing {EVENT_HEADER} header")))?;

    let name = std::str::from_utf8(header)
        .map_err(|_| MessagingError::Malformed(format!("{EVENT_HEADER} header is not UTF-8")))?;
    let name = EventName::parse(name)?;

    let payload = payload.ok_or_else(|| MessagingError::Malformed("empty payload".to_string()))?;
    registry.decode(payload, &name)
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct KafkaNotificationConsumer {
    config: KafkaConfig,
    registry: Arc<CodecRegistry>,
    subscribed: AtomicBool,
    connected: Arc<AtomicBool>,
    running: Mutex<Option<Running>>,
    metrics: Option<Arc<Metrics>>,
}

impl KafkaNotificationConsumer {
    pub fn new(config: KafkaConfig, registry: Arc<CodecRegistry>) -> Self {
        Self {
            config,
            registry,
            subscribed: AtomicBool::new(false),
            connected: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn create_consumer(&self, consumer_group: &str) -> Result<StreamConsumer, MessagingError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("client.id", &self.config.client_id)
            .set("group.id", consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "6000")
            .create()?;
        Ok(consumer)
    }
}

#[async_trait]
impl NotificationConsumer for KafkaNotificationConsumer {
    async fn get_listener(
        &self,
        topics: &[String],
        consumer_group: &str,
    ) -> Result<NotificationStream, MessagingError> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(MessagingError::AlreadySubscribed);
        }

        let consumer = self.create_consumer(consumer_group)?;
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs)?;

        tracing::info!(
            group = %consumer_group,
            topics = ?topics,
            "Notification listener subscribed"
        );

        let (sender, receiver) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);
        self.connected.store(true, Ordering::SeqCst);

        let task = tokio::spawn(consume_loop(
            consumer,
            self.registry.clone(),
            sender,
            shutdown_rx,
            self.connected.clone(),
            self.metrics.clone(),
            consumer_group.to_string(),
        ));

        *self.running.lock().await = Some(Running { shutdown, task });
        Ok(NotificationStream::new(receiver))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return true;
        };

        tracing::warn!("Disconnecting notification consumer");
        // Err means the loop already ended
        let _ = running.shutdown.send(true);

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, running.task).await {
            Ok(Ok(())) => {
                tracing::warn!("Notification consumer disconnected");
                true
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Notification consumer task failed");
                false
            }
            Err(_) => {
                tracing::error!("Timed out waiting for notification consumer to stop");
                false
            }
        }
    }
}

async fn consume_loop(
    consumer: StreamConsumer,
    registry: Arc<CodecRegistry>,
    sender: mpsc::Sender<Delivery>,
    mut shutdown: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    metrics: Option<Arc<Metrics>>,
    group: String,
) {
    let mut acknowledged = TopicPartitionList::new();

    loop {
        let (decoded, position) = tokio::select! {
            _ = shutdown.changed() => break,
            received = consumer.recv() => match received {
                Ok(message) => {
                    let decoded = decode_notification(&registry, message.headers(), message.payload());
                    let position = (message.topic().to_string(), message.partition(), message.offset());
                    (decoded, position)
                }
                Err(e) => {
                    tracing::error!(group = %group, error = %e, "Kafka consumer error");
                    continue;
                }
            },
        };

        let (topic, partition, offset) = position;
        match decoded {
            Ok(event) => {
                tracing::debug!(
                    group = %group,
                    topic = %topic,
                    event_name = %event.name,
                    "Consumed notification"
                );
                if let Some(metrics) = &metrics {
                    metrics.record_notification_received(&topic);
                }

                let (delivery, acked) = Delivery::new(event);
                if sender.send(delivery).await.is_err() {
                    tracing::debug!(group = %group, "Notification stream dropped, stopping consumer");
                    break;
                }
                if !wait_for_ack(acked, &mut shutdown).await {
                    tracing::info!(
                        group = %group,
                        topic = %topic,
                        partition = partition,
                        offset = offset,
                        "Notification not acknowledged, left for redelivery"
                    );
                    break;
                }
            }
            Err(e) => {
                tracing::error!(
                    group = %group,
                    topic = %topic,
                    partition = partition,
                    offset = offset,
                    error = %e,
                    "Dropping undecodable notification"
                );
                if let Some(metrics) = &metrics {
                    metrics.record_notification_dropped(&topic, "decode");
                }
            }
        }

        if let Err(e) = track(&mut acknowledged, &topic, partition, offset) {
            tracing::warn!(group = %group, topic = %topic, error = %e, "Failed to track offset");
            continue;
        }
        if let Err(e) = consumer.commit(&acknowledged, CommitMode::Async) {
            tracing::warn!(group = %group, topic = %topic, error = %e, "Failed to commit offset");
        }
    }

    if acknowledged.count() > 0 {
        if let Err(e) = consumer.commit(&acknowledged, CommitMode::Sync) {
            tracing::warn!(group = %group, error = %e, "Failed to commit offsets on shutdown");
        }
    }
    consumer.unsubscribe();
    connected.store(false, Ordering::SeqCst);
    tracing::info!(group = %group, "Notification consumer loop stopped");
}

/// Record `offset` as handled: the committed position becomes `offset + 1`.
fn track(positions: &mut TopicPartitionList, topic: &str, partition: i32, offset: i64) -> KafkaResult<()> {
    let next = Offset::Offset(offset + 1);
    if positions.find_partition(topic, partition).is_some() {
        positions.set_partition_offset(topic, partition, next)
    } else {
        positions.add_partition_offset(topic, partition, next)
    }
}

/// `true` once the delivery is acknowledged. An ack that is already sent
/// wins over a shutdown signal that arrives at the same time.
async fn wait_for_ack(acked: oneshot::Receiver<()>, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        acked = acked => acked.is_ok(),
        _ = shutdown.changed() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::codec::tests::{ticked, CounterPayload};
    use rdkafka::message::{Header, OwnedHeaders};

    fn registry() -> CodecRegistry {
        CodecRegistry::new().register::<CounterPayload>().unwrap()
    }

    fn headers(name: &str) -> OwnedHeaders {
        OwnedHeaders::new().insert(Header {
            key: EVENT_HEADER,
            value: Some(name.as_bytes()),
        })
    }

    #[test]
    fn test_decodes_with_name_from_header() {
        let registry = registry();
        let event = ticked(7);
        let payload = registry.encode(&event).unwrap();

        let decoded = decode_notification(
            &registry,
            Some(&headers("testing.counter:ticked")),
            Some(payload.as_slice()),
        )
        .unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_missing_header_is_rejected() {
        let registry = registry();
        let payload = registry.encode(&ticked(7)).unwrap();

        let err = decode_notification::<OwnedHeaders>(&registry, None, Some(payload.as_slice())).unwrap_err();
        assert!(matches!(err, MessagingError::Malformed(_)));

        let other = OwnedHeaders::new().insert(Header {
            key: "traceId",
            value: Some("abc".as_bytes()),
        });
        assert!(decode_notification(&registry, Some(&other), Some(payload.as_slice())).is_err());
    }

    #[test]
    fn test_unknown_topic_and_bad_names() {
        let registry = registry();
        let payload = registry.encode(&ticked(7)).unwrap();

        assert!(matches!(
            decode_notification(&registry, Some(&headers("billing.invoice:paid")), Some(payload.as_slice())),
            Err(MessagingError::MessagePacking(_))
        ));
        assert!(matches!(
            decode_notification(&registry, Some(&headers("not a name")), Some(payload.as_slice())),
            Err(MessagingError::InvalidEventName(_))
        ));
        assert!(decode_notification(&registry, Some(&headers("testing.counter:ticked")), None).is_err());
    }

    #[test]
    fn test_tracked_positions_point_past_the_last_ack() {
        let mut positions = TopicPartitionList::new();
        track(&mut positions, "testing.events.counter", 0, 4).unwrap();
        track(&mut positions, "testing.events.counter", 0, 5).unwrap();
        track(&mut positions, "testing.events.counter", 1, 9).unwrap();

        assert_eq!(positions.count(), 2);
        let first = positions.find_partition("testing.events.counter", 0).unwrap();
        assert_eq!(first.offset(), Offset::Offset(6));
        let second = positions.find_partition("testing.events.counter", 1).unwrap();
        assert_eq!(second.offset(), Offset::Offset(10));
    }

    #[tokio::test]
    async fn test_only_acknowledged_deliveries_are_committed() {
        let (_stop, mut shutdown) = watch::channel(false);

        let (delivery, acked) = Delivery::new(ticked(1));
        delivery.ack();
        assert!(wait_for_ack(acked, &mut shutdown).await);

        let (delivery, acked) = Delivery::new(ticked(2));
        drop(delivery);
        assert!(!wait_for_ack(acked, &mut shutdown).await);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_pending_delivery_uncommitted() {
        let (stop, mut shutdown) = watch::channel(false);
        let (delivery, acked) = Delivery::new(ticked(3));

        stop.send(true).unwrap();
        assert!(!wait_for_ack(acked, &mut shutdown).await);
        assert_eq!(delivery.event.sequence, 3);
    }

    #[tokio::test]
    async fn test_ack_sent_before_shutdown_still_counts() {
        let (stop, mut shutdown) = watch::channel(false);
        let (delivery, acked) = Delivery::new(ticked(4));

        delivery.ack();
        stop.send(true).unwrap();
        assert!(wait_for_ack(acked, &mut shutdown).await);
    }

    #[tokio::test]
    async fn test_disconnect_without_subscription() {
        let consumer = KafkaNotificationConsumer::new(
            KafkaConfig {
                brokers: "127.0.0.1:1".to_string(),
                client_id: "test".to_string(),
                topic_partitions: 1,
            },
            Arc::new(registry()),
        );

        assert!(!consumer.is_connected());
        assert!(consumer.disconnect().await);
    }
}
