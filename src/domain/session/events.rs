use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::contracts::SIGN_UP_REQUESTED;
use crate::domain::user::Email;
use crate::event_sourcing::core::{AggregateId, DomainEvent, EventPayload};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequested {
    pub session_id: AggregateId,
    pub user_id: AggregateId,
    pub email: Email,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SignUpRequested(SignUpRequested),
}

impl DomainEvent for SessionEvent {
    fn names() -> &'static [&'static str] {
        const NAMES: &[&str] = &[SIGN_UP_REQUESTED];
        NAMES
    }

    fn name(&self) -> &'static str {
        match self {
            SessionEvent::SignUpRequested(_) => SIGN_UP_REQUESTED,
        }
    }

    fn data(&self) -> Result<Value, serde_json::Error> {
        match self {
            SessionEvent::SignUpRequested(e) => serde_json::to_value(e),
        }
    }
}

impl EventPayload for SignUpRequested {
    type Event = SessionEvent;
    const NAME: &'static str = SIGN_UP_REQUESTED;

    fn wrap(self) -> SessionEvent {
        SessionEvent::SignUpRequested(self)
    }

    fn unwrap(event: &SessionEvent) -> Option<&Self> {
        match event {
            SessionEvent::SignUpRequested(e) => Some(e),
        }
    }
}
