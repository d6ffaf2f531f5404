// ============================================================================
// Messaging - broker bridge for cross-service notifications
// ============================================================================
//
// Outbound: committed StoredEvent -> codec -> Kafka topic (key = aggregate id)
// Inbound:  Kafka topic -> codec -> StoredEvent -> NotificationHandler
//
// ============================================================================

pub mod admin;
pub mod codec;
pub mod consumer;
pub mod inbound;
pub mod producer;

pub use admin::create_topics;
pub use codec::{CodecRegistry, MessagingError, NotificationCodec, NotificationEnvelope, ProstCodec, TopicPayload};
pub use consumer::{Delivery, KafkaNotificationConsumer, NotificationConsumer, NotificationStream};
pub use inbound::NotificationHandler;
pub use producer::{KafkaNotificationProducer, NotificationProducer, OutboundNotification, EVENT_HEADER};
