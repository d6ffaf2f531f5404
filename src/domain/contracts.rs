use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event_sourcing::core::EventName;
use crate::messaging::{CodecRegistry, MessagingError, TopicPayload};

// ============================================================================
// Authentication contracts - shared with other services
// ============================================================================
//
// Event names, topics and the protobuf notification messages. Passwords
// never leave the authentication service and have no field here.
//
// ============================================================================

pub const USER_CREATED: &str = "authentication.user:created";
pub const USER_EMAIL_CHANGED: &str = "authentication.user:emailChanged";
pub const SIGN_UP_REQUESTED: &str = "authentication.session:signUpRequested";

pub const USER_TOPIC: &str = "authentication.events.user";
pub const SESSION_TOPIC: &str = "authentication.events.session";

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreatedMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub email: String,
    #[prost(string, tag = "3")]
    pub created_at: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEmailChangedMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub email: String,
    #[prost(string, tag = "3")]
    pub changed_at: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequestedMessage {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(string, tag = "2")]
    pub user_id: String,
    #[prost(string, tag = "3")]
    pub email: String,
    #[prost(string, tag = "4")]
    pub requested_at: String,
}

/// Payload of `authentication.events.user`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserNotification {
    #[prost(oneof = "UserNotificationData", tags = "1, 2")]
    pub data: Option<UserNotificationData>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum UserNotificationData {
    #[prost(message, tag = "1")]
    Created(UserCreatedMessage),
    #[prost(message, tag = "2")]
    EmailChanged(UserEmailChangedMessage),
}

/// Payload of `authentication.events.session`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionNotification {
    #[prost(oneof = "SessionNotificationData", tags = "1")]
    pub data: Option<SessionNotificationData>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum SessionNotificationData {
    #[prost(message, tag = "1")]
    SignUpRequested(SignUpRequestedMessage),
}

fn unknown_variant(topic: &str, name: &EventName) -> MessagingError {
    MessagingError::UnknownVariant {
        topic: topic.to_string(),
        event: name.event().to_string(),
    }
}

impl TopicPayload for UserNotification {
    const TOPIC: &'static str = USER_TOPIC;

    fn pack(name: &EventName, data: &Value) -> Result<Self, MessagingError> {
        let data = match name.event() {
            "created" => UserNotificationData::Created(serde_json::from_value(data.clone())?),
            "emailChanged" => UserNotificationData::EmailChanged(serde_json::from_value(data.clone())?),
            _ => return Err(unknown_variant(Self::TOPIC, name)),
        };
        Ok(Self { data: Some(data) })
    }

    fn unpack(self, name: &EventName) -> Result<Value, MessagingError> {
        match (name.event(), self.data) {
            ("created", Some(UserNotificationData::Created(m))) => Ok(serde_json::to_value(m)?),
            ("emailChanged", Some(UserNotificationData::EmailChanged(m))) => Ok(serde_json::to_value(m)?),
            _ => Err(unknown_variant(Self::TOPIC, name)),
        }
    }
}

impl TopicPayload for SessionNotification {
    const TOPIC: &'static str = SESSION_TOPIC;

    fn pack(name: &EventName, data: &Value) -> Result<Self, MessagingError> {
        match name.event() {
            "signUpRequested" => Ok(Self {
                data: Some(SessionNotificationData::SignUpRequested(serde_json::from_value(
                    data.clone(),
                )?)),
            }),
            _ => Err(unknown_variant(Self::TOPIC, name)),
        }
    }

    fn unpack(self, name: &EventName) -> Result<Value, MessagingError> {
        match (name.event(), self.data) {
            ("signUpRequested", Some(SessionNotificationData::SignUpRequested(m))) => Ok(serde_json::to_value(m)?),
            _ => Err(unknown_variant(Self::TOPIC, name)),
        }
    }
}

/// Codecs for every topic the authentication service publishes.
pub fn codec_registry() -> Result<CodecRegistry, MessagingError> {
    CodecRegistry::new()
        .register::<UserNotification>()?
        .register::<SessionNotification>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::{AggregateId, StoredEvent};
    use crate::messaging::producer::build_notification;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    fn user_created(sequence: u64) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::new_v4(),
            aggregate_id: AggregateId::from("u1"),
            version: 1,
            name: EventName::parse(USER_CREATED).unwrap(),
            data: json!({"id": "u1", "email": "a@b.com", "createdAt": "2024-03-01T10:00:00Z"}),
            inserted_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            sequence,
        }
    }

    #[test]
    fn test_user_created_message_is_keyed_and_named() {
        let registry = codec_registry().unwrap();
        let event = user_created(42);
        assert_eq!(event.topic(), USER_TOPIC);

        let notification = build_notification(&registry, &event).unwrap();
        assert_eq!(notification.event_name, "authentication.user:created");
        assert_eq!(notification.key, "u1");

        let decoded = registry.decode(&notification.payload, &event.name).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.sequence, 42);
    }

    #[test]
    fn test_every_topic_round_trips() {
        let registry = codec_registry().unwrap();
        assert_eq!(registry.topics(), vec![SESSION_TOPIC.to_string(), USER_TOPIC.to_string()]);

        let mut changed = user_created(2);
        changed.name = EventName::parse(USER_EMAIL_CHANGED).unwrap();
        changed.data = json!({"id": "u1", "email": "c@d.org", "changedAt": "2024-03-02T10:00:00Z"});

        let mut requested = user_created(1);
        requested.aggregate_id = AggregateId::from("s1");
        requested.name = EventName::parse(SIGN_UP_REQUESTED).unwrap();
        requested.data = json!({
            "sessionId": "s1",
            "userId": "u1",
            "email": "a@b.com",
            "requestedAt": "2024-03-01T10:00:00Z"
        });

        for event in [user_created(1), changed, requested] {
            let bytes = registry.encode(&event).unwrap();
            assert_eq!(registry.decode(&bytes, &event.name).unwrap(), event);
        }
    }

    #[test]
    fn test_event_from_wrong_topic_payload_is_rejected() {
        let registry = codec_registry().unwrap();
        let bytes = registry.encode(&user_created(1)).unwrap();

        let wrong = EventName::parse(USER_EMAIL_CHANGED).unwrap();
        assert!(matches!(
            registry.decode(&bytes, &wrong),
            Err(MessagingError::UnknownVariant { .. })
        ));
    }
}
