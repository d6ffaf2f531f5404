use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::codec::{CodecRegistry, MessagingError};
use crate::config::KafkaConfig;
use crate::event_sourcing::core::StoredEvent;
use crate::metrics::Metrics;

/// Broker header carrying the canonical event name.
pub const EVENT_HEADER: &str = "eventName";

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Pushes committed events to broker topics. Best effort: failures are
/// logged and never surface to the caller.
#[async_trait]
pub trait NotificationProducer: Send + Sync {
    async fn publish_notifications(&self, topic: &str, events: &[StoredEvent]);

    fn is_connected(&self) -> bool;

    /// Flush and drop the connection. `false` when flushing failed.
    async fn disconnect(&self) -> bool;
}

/// One encoded broker message, before it is handed to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundNotification {
    pub key: String,
    pub event_name: String,
    pub payload: Vec<u8>,
}

impl OutboundNotification {
    fn headers(&self) -> OwnedHeaders {
        OwnedHeaders::new().insert(Header {
            key: EVENT_HEADER,
            value: Some(self.event_name.as_bytes()),
        })
    }

    fn record<'a>(&'a self, topic: &'a str) -> FutureRecord<'a, String, Vec<u8>> {
        FutureRecord::to(topic)
            .key(&self.key)
            .payload(&self.payload)
            .headers(self.headers())
    }
}

/// Key by aggregate id so one aggregate's events keep their order.
pub fn build_notification(
    registry: &CodecRegistry,
    event: &StoredEvent,
) -> Result<OutboundNotification, MessagingError> {
    Ok(OutboundNotification {
        key: event.aggregate_id.to_string(),
        event_name: event.name.to_string(),
        payload: registry.encode(event)?,
    })
}

pub struct KafkaNotificationProducer {
    config: KafkaConfig,
    registry: Arc<CodecRegistry>,
    producer: RwLock<Option<FutureProducer>>,
    connected: AtomicBool,
    metrics: Option<Arc<Metrics>>,
}

impl KafkaNotificationProducer {
    pub fn new(config: KafkaConfig, registry: Arc<CodecRegistry>) -> Self {
        Self {
            config,
            registry,
            producer: RwLock::new(None),
            connected: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn connection(&self) -> Result<FutureProducer, MessagingError> {
        if let Some(producer) = self.producer.read().await.as_ref() {
            return Ok(producer.clone());
        }

        let mut slot = self.producer.write().await;
        if let Some(producer) = slot.as_ref() {
            return Ok(producer.clone());
        }

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("client.id", &self.config.client_id)
            .set("message.timeout.ms", "5000")
            .create()?;

        tracing::debug!(brokers = %self.config.brokers, "Notification producer connected");
        *slot = Some(producer.clone());
        self.connected.store(true, Ordering::SeqCst);
        Ok(producer)
    }

    fn failed(&self, topic: &str, reason: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_notification_failed(topic, reason);
        }
    }
}

#[async_trait]
impl NotificationProducer for KafkaNotificationProducer {
    async fn publish_notifications(&self, topic: &str, events: &[StoredEvent]) {
        if events.is_empty() {
            return;
        }

        let producer = match self.connection().await {
            Ok(producer) => producer,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Failed to connect, notifications not sent");
                self.failed(topic, "connect");
                return;
            }
        };

        for event in events {
            let notification = match build_notification(&self.registry, event) {
                Ok(notification) => notification,
                Err(e) => {
                    tracing::error!(
                        topic = %topic,
                        event_name = %event.name,
                        event_id = %event.event_id,
                        error = %e,
                        "Failed to encode notification"
                    );
                    self.failed(topic, "encode");
                    continue;
                }
            };

            match producer.send(notification.record(topic), SEND_TIMEOUT).await {
                Ok(_) => {
                    tracing::info!(
                        topic = %topic,
                        key = %notification.key,
                        event_name = %notification.event_name,
                        sequence = event.sequence,
                        "📤 Notification sent"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_notification_published(topic);
                    }
                }
                Err((e, _)) => {
                    tracing::warn!(
                        topic = %topic,
                        event_name = %notification.event_name,
                        error = %e,
                        "Failed to send notification"
                    );
                    self.failed(topic, "send");
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> bool {
        let Some(producer) = self.producer.write().await.take() else {
            return true;
        };
        self.connected.store(false, Ordering::SeqCst);

        match producer.flush(SEND_TIMEOUT) {
            Ok(()) => {
                tracing::info!("Notification producer disconnected");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Error while flushing notification producer");
                false
            }
        }
    }
}
