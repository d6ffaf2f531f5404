use chrono::{DateTime, Utc};
use prost::Message;
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{ErrorCategory, ServiceError};
use crate::event_sourcing::core::{is_valid_topic, AggregateId, EventName, InvalidEventName, StoredEvent};

// ============================================================================
// Notification wire format
// ============================================================================
//
// Every broker message is a protobuf envelope with the stored event fields.
// `data` carries the topic's payload message: a oneof with one variant per
// event of the aggregate. A nested message and a bytes field share the same
// wire encoding, so the envelope stays topic-agnostic.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("No message packing registered for topic {0}")]
    MessagePacking(String),

    #[error("Invalid topic name: {0}")]
    InvalidTopic(String),

    #[error("Event {event} has no variant in the {topic} message")]
    UnknownVariant { topic: String, event: String },

    #[error("Malformed notification: {0}")]
    Malformed(String),

    #[error(transparent)]
    InvalidEventName(#[from] InvalidEventName),

    #[error("Failed to decode notification: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Failed to encode notification: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("Payload mapping failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Consumer is already subscribed")]
    AlreadySubscribed,
}

impl ServiceError for MessagingError {
    fn category(&self) -> ErrorCategory {
        match self {
            MessagingError::MessagePacking(_)
            | MessagingError::InvalidTopic(_)
            | MessagingError::UnknownVariant { .. }
            | MessagingError::InvalidEventName(_) => ErrorCategory::InvalidArgument,
            MessagingError::Kafka(_) => ErrorCategory::Unavailable,
            _ => ErrorCategory::Internal,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NotificationEnvelope {
    #[prost(string, tag = "1")]
    pub event_id: String,
    #[prost(string, tag = "2")]
    pub aggregate_id: String,
    #[prost(uint64, tag = "3")]
    pub version: u64,
    #[prost(string, tag = "4")]
    pub name: String,
    #[prost(message, optional, tag = "5")]
    pub inserted_at: Option<prost_types::Timestamp>,
    #[prost(uint64, tag = "6")]
    pub sequence: u64,
    #[prost(bytes = "vec", tag = "7")]
    pub data: Vec<u8>,
}

/// The protobuf payload of one topic, keyed by the short event name
/// (`created` in `authentication.user:created`).
pub trait TopicPayload: Message + Default + Sized + Send + Sync + 'static {
    const TOPIC: &'static str;

    fn pack(name: &EventName, data: &Value) -> Result<Self, MessagingError>;

    fn unpack(self, name: &EventName) -> Result<Value, MessagingError>;
}

pub trait NotificationCodec: Send + Sync {
    fn encode(&self, event: &StoredEvent) -> Result<Vec<u8>, MessagingError>;

    fn decode(&self, bytes: &[u8], name: &EventName) -> Result<StoredEvent, MessagingError>;
}

pub struct ProstCodec<T> {
    _payload: PhantomData<fn() -> T>,
}

impl<T: TopicPayload> ProstCodec<T> {
    pub fn new() -> Self {
        Self { _payload: PhantomData }
    }
}

impl<T: TopicPayload> Default for ProstCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TopicPayload> NotificationCodec for ProstCodec<T> {
    fn encode(&self, event: &StoredEvent) -> Result<Vec<u8>, MessagingError> {
        let payload = T::pack(&event.name, &event.data)?;
        let envelope = NotificationEnvelope {
            event_id: event.event_id.to_string(),
            aggregate_id: event.aggregate_id.to_string(),
            version: event.version,
            name: event.name.to_string(),
            inserted_at: Some(to_timestamp(&event.inserted_at)),
            sequence: event.sequence,
            data: payload.encode_to_vec(),
        };

        let mut buf = Vec::with_capacity(envelope.encoded_len());
        envelope.encode(&mut buf)?;
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8], name: &EventName) -> Result<StoredEvent, MessagingError> {
        let envelope = NotificationEnvelope::decode(bytes)?;
        let payload = T::decode(envelope.data.as_slice())?;

        let event_id = Uuid::parse_str(&envelope.event_id)
            .map_err(|e| MessagingError::Malformed(format!("event id {}: {e}", envelope.event_id)))?;
        let inserted_at = envelope
            .inserted_at
            .as_ref()
            .and_then(from_timestamp)
            .ok_or_else(|| MessagingError::Malformed("missing or invalid insertion time".to_string()))?;

        Ok(StoredEvent {
            event_id,
            aggregate_id: AggregateId::from(envelope.aggregate_id),
            version: envelope.version,
            name: name.clone(),
            data: payload.unpack(name)?,
            inserted_at,
            sequence: envelope.sequence,
        })
    }
}

fn to_timestamp(at: &DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

fn from_timestamp(ts: &prost_types::Timestamp) -> Option<DateTime<Utc>> {
    let nanos = u32::try_from(ts.nanos).ok()?;
    DateTime::from_timestamp(ts.seconds, nanos)
}

/// Topic to codec lookup, filled once at startup.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: BTreeMap<String, Arc<dyn NotificationCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: TopicPayload>(self) -> Result<Self, MessagingError> {
        self.register_codec(T::TOPIC, ProstCodec::<T>::new())
    }

    pub fn register_codec<C>(mut self, topic: &str, codec: C) -> Result<Self, MessagingError>
    where
        C: NotificationCodec + 'static,
    {
        if !is_valid_topic(topic) {
            return Err(MessagingError::InvalidTopic(topic.to_string()));
        }
        self.codecs.insert(topic.to_string(), Arc::new(codec));
        Ok(self)
    }

    pub fn topics(&self) -> Vec<String> {
        self.codecs.keys().cloned().collect()
    }

    pub fn encode(&self, event: &StoredEvent) -> Result<Vec<u8>, MessagingError> {
        self.codec(&event.topic())?.encode(event)
    }

    pub fn decode(&self, bytes: &[u8], name: &EventName) -> Result<StoredEvent, MessagingError> {
        self.codec(&name.topic())?.decode(bytes, name)
    }

    fn codec(&self, topic: &str) -> Result<&Arc<dyn NotificationCodec>, MessagingError> {
        self.codecs
            .get(topic)
            .ok_or_else(|| MessagingError::MessagePacking(topic.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    // Minimal payload for the codec tests
    #[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
    pub struct Ticked {
        #[prost(int64, tag = "1")]
        pub by: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CounterPayload {
        #[prost(oneof = "CounterPayloadData", tags = "1")]
        pub data: Option<CounterPayloadData>,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum CounterPayloadData {
        #[prost(message, tag = "1")]
        Ticked(Ticked),
    }

    impl TopicPayload for CounterPayload {
        const TOPIC: &'static str = "testing.events.counter";

        fn pack(name: &EventName, data: &Value) -> Result<Self, MessagingError> {
            let data = match name.event() {
                "ticked" => CounterPayloadData::Ticked(serde_json::from_value(data.clone())?),
                other => {
                    return Err(MessagingError::UnknownVariant {
                        topic: Self::TOPIC.to_string(),
                        event: other.to_string(),
                    })
                }
            };
            Ok(Self { data: Some(data) })
        }

        fn unpack(self, name: &EventName) -> Result<Value, MessagingError> {
            match self.data {
                Some(CounterPayloadData::Ticked(ticked)) if name.event() == "ticked" => {
                    Ok(serde_json::to_value(ticked)?)
                }
                _ => Err(MessagingError::UnknownVariant {
                    topic: Self::TOPIC.to_string(),
                    event: name.event().to_string(),
                }),
            }
        }
    }

    pub fn ticked(sequence: u64) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::new_v4(),
            aggregate_id: AggregateId::from("c1"),
            version: 3,
            name: EventName::parse("testing.counter:ticked").unwrap(),
            data: json!({"by": 2}),
            inserted_at: DateTime::from_timestamp(1_700_000_000, 123_000_000).unwrap(),
            sequence,
        }
    }

    #[test]
    fn test_round_trip_through_registry() {
        let registry = CodecRegistry::new().register::<CounterPayload>().unwrap();
        let event = ticked(42);

        let bytes = registry.encode(&event).unwrap();
        let decoded = registry.decode(&bytes, &event.name).unwrap();

        assert_eq!(decoded, event);
        assert_eq!(registry.topics(), vec!["testing.events.counter".to_string()]);
    }

    #[test]
    fn test_envelope_carries_stored_fields() {
        let event = ticked(42);
        let bytes = ProstCodec::<CounterPayload>::new().encode(&event).unwrap();

        let envelope = NotificationEnvelope::decode(bytes.as_slice()).unwrap();
        assert_eq!(envelope.sequence, 42);
        assert_eq!(envelope.version, 3);
        assert_eq!(envelope.name, "testing.counter:ticked");
        assert_eq!(envelope.aggregate_id, "c1");
        assert_eq!(envelope.inserted_at.unwrap().seconds, 1_700_000_000);

        let payload = CounterPayload::decode(envelope.data.as_slice()).unwrap();
        assert_eq!(payload.data, Some(CounterPayloadData::Ticked(Ticked { by: 2 })));
    }

    #[test]
    fn test_unregistered_topic_is_message_packing_error() {
        let registry = CodecRegistry::new();
        let err = registry.encode(&ticked(1)).unwrap_err();

        assert!(matches!(err, MessagingError::MessagePacking(ref t) if t == "testing.events.counter"));
        assert_eq!(err.category(), ErrorCategory::InvalidArgument);
    }

    #[test]
    fn test_unknown_event_in_known_topic() {
        let registry = CodecRegistry::new().register::<CounterPayload>().unwrap();
        let mut event = ticked(1);
        event.name = EventName::parse("testing.counter:reset").unwrap();

        assert!(matches!(
            registry.encode(&event),
            Err(MessagingError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn test_registration_validates_topic() {
        let result = CodecRegistry::new().register_codec("counter", ProstCodec::<CounterPayload>::new());
        assert!(matches!(result, Err(MessagingError::InvalidTopic(_))));
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        let registry = CodecRegistry::new().register::<CounterPayload>().unwrap();
        let name = EventName::parse("testing.counter:ticked").unwrap();

        assert!(registry.decode(&[0xff, 0xff, 0xff], &name).is_err());
    }
}
