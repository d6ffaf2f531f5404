use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use super::events::{SessionEvent, SignUpRequested};
use crate::domain::errors::AuthenticationError;
use crate::domain::user::Email;
use crate::event_sourcing::core::{Aggregate, AggregateId, AggregateRoot, EventHandlers, EventPayload};

// ============================================================================
// Session Aggregate - one sign-up / sign-in attempt
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub id: AggregateId,
    pub user_id: AggregateId,
    pub email: Option<Email>,
}

#[derive(Debug, Default)]
pub struct Session {
    root: AggregateRoot,
    id: AggregateId,
    user_id: AggregateId,
    email: Option<Email>,
}

impl Session {
    pub fn request_sign_up(
        session_id: AggregateId,
        user_id: AggregateId,
        email: Email,
        requested_at: DateTime<Utc>,
    ) -> Result<Self, AuthenticationError> {
        let mut session = Session::default();
        session.apply(
            SignUpRequested {
                session_id,
                user_id,
                email,
                requested_at,
            }
            .wrap(),
        )?;
        Ok(session)
    }

    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    pub fn user_id(&self) -> &AggregateId {
        &self.user_id
    }

    fn sign_up_requested(&mut self, event: &SignUpRequested) {
        self.id = event.session_id.clone();
        self.user_id = event.user_id.clone();
        self.email = Some(event.email.clone());
    }
}

impl Aggregate for Session {
    type Event = SessionEvent;
    type State = SessionState;

    fn handlers() -> &'static EventHandlers<Self> {
        static HANDLERS: OnceLock<EventHandlers<Session>> = OnceLock::new();
        HANDLERS.get_or_init(|| EventHandlers::new("session").on(Session::sign_up_requested))
    }

    fn aggregate_id(&self) -> &AggregateId {
        &self.id
    }

    fn root(&self) -> &AggregateRoot {
        &self.root
    }

    fn root_mut(&mut self) -> &mut AggregateRoot {
        &mut self.root
    }

    fn serialize_state(&self) -> SessionState {
        SessionState {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            email: self.email.clone(),
        }
    }

    fn apply_state(&mut self, state: SessionState) {
        self.id = state.id;
        self.user_id = state.user_id;
        self.email = state.email;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::contracts::SIGN_UP_REQUESTED;
    use crate::event_sourcing::core::DomainEvent;

    #[test]
    fn test_sign_up_request() {
        Session::handlers().validate().unwrap();

        let mut session = Session::request_sign_up(
            AggregateId::from("s1"),
            AggregateId::from("u1"),
            Email::parse("a@b.com").unwrap(),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(session.id().as_str(), "s1");
        assert_eq!(session.user_id().as_str(), "u1");

        let stream = session.reset_events();
        let event = stream.first().unwrap();
        assert_eq!(event.name.to_string(), "authentication.session:signUpRequested");
        assert_eq!(event.data["userId"], "u1");
        assert_eq!(event.data["sessionId"], "s1");
        assert!(SessionEvent::names().contains(&SIGN_UP_REQUESTED));
    }
}
