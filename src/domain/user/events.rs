use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::value_objects::Email;
use crate::domain::contracts::{USER_CREATED, USER_EMAIL_CHANGED};
use crate::event_sourcing::core::{AggregateId, DomainEvent, EventPayload};

// ============================================================================
// User Domain Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreated {
    pub id: AggregateId,
    pub email: Email,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEmailChanged {
    pub id: AggregateId,
    pub email: Email,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    Created(UserCreated),
    EmailChanged(UserEmailChanged),
}

impl DomainEvent for UserEvent {
    fn names() -> &'static [&'static str] {
        const NAMES: &[&str] = &[USER_CREATED, USER_EMAIL_CHANGED];
        NAMES
    }

    fn name(&self) -> &'static str {
        match self {
            UserEvent::Created(_) => USER_CREATED,
            UserEvent::EmailChanged(_) => USER_EMAIL_CHANGED,
        }
    }

    fn data(&self) -> Result<Value, serde_json::Error> {
        match self {
            UserEvent::Created(e) => serde_json::to_value(e),
            UserEvent::EmailChanged(e) => serde_json::to_value(e),
        }
    }
}

impl EventPayload for UserCreated {
    type Event = UserEvent;
    const NAME: &'static str = USER_CREATED;

    fn wrap(self) -> UserEvent {
        UserEvent::Created(self)
    }

    fn unwrap(event: &UserEvent) -> Option<&Self> {
        match event {
            UserEvent::Created(e) => Some(e),
            _ => None,
        }
    }
}

impl EventPayload for UserEmailChanged {
    type Event = UserEvent;
    const NAME: &'static str = USER_EMAIL_CHANGED;

    fn wrap(self) -> UserEvent {
        UserEvent::EmailChanged(self)
    }

    fn unwrap(event: &UserEvent) -> Option<&Self> {
        match event {
            UserEvent::EmailChanged(e) => Some(e),
            _ => None,
        }
    }
}
