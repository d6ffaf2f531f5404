use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use super::events::{UserCreated, UserEmailChanged, UserEvent};
use super::value_objects::Email;
use crate::domain::errors::AuthenticationError;
use crate::event_sourcing::core::{Aggregate, AggregateId, AggregateRoot, EventHandlers, EventPayload};

// ============================================================================
// User Aggregate
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    pub id: AggregateId,
    pub email: Option<Email>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct User {
    root: AggregateRoot,
    id: AggregateId,
    email: Option<Email>,
    created_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn create(id: AggregateId, email: Email, created_at: DateTime<Utc>) -> Result<Self, AuthenticationError> {
        let mut user = User::default();
        user.apply(UserCreated { id, email, created_at }.wrap())?;
        Ok(user)
    }

    pub fn change_email(&mut self, email: Email, changed_at: DateTime<Utc>) -> Result<(), AuthenticationError> {
        if self.email.as_ref() == Some(&email) {
            return Err(AuthenticationError::EmailUnchanged(self.id.clone()));
        }

        self.apply(
            UserEmailChanged {
                id: self.id.clone(),
                email,
                changed_at,
            }
            .wrap(),
        )?;
        Ok(())
    }

    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    pub fn email(&self) -> Option<&Email> {
        self.email.as_ref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    fn created(&mut self, event: &UserCreated) {
        self.id = event.id.clone();
        self.email = Some(event.email.clone());
        self.created_at = Some(event.created_at);
    }

    fn email_changed(&mut self, event: &UserEmailChanged) {
        self.email = Some(event.email.clone());
    }
}

impl Aggregate for User {
    type Event = UserEvent;
    type State = UserState;

    fn handlers() -> &'static EventHandlers<Self> {
        static HANDLERS: OnceLock<EventHandlers<User>> = OnceLock::new();
        HANDLERS.get_or_init(|| {
            EventHandlers::new("user")
                .on(User::created)
                .on(User::email_changed)
        })
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

    fn serialize_state(&self) -> UserState {
        UserState {
            id: self.id.clone(),
            email: self.email.clone(),
            created_at: self.created_at,
        }
    }

    fn apply_state(&mut self, state: UserState) {
        self.id = state.id;
        self.email = state.email;
        self.created_at = state.created_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::EventSourcingError;
    use crate::event_sourcing::publishing::DomainEventsPublisher;
    use crate::event_sourcing::store::{EventStore, InMemoryEventStore};

    fn email(raw: &str) -> Email {
        Email::parse(raw).unwrap()
    }

    #[test]
    fn test_handlers_cover_every_event() {
        User::handlers().validate().unwrap();
    }

    #[test]
    fn test_create_and_change_email() {
        let mut user = User::create(AggregateId::from("u1"), email("a@b.com"), Utc::now()).unwrap();
        assert_eq!(user.aggregate_version(), 1);
        assert_eq!(user.persisted_version(), 0);

        user.change_email(email("c@d.org"), Utc::now()).unwrap();
        assert_eq!(user.email().unwrap().as_str(), "c@d.org");
        assert_eq!(user.aggregate_version(), 2);

        let err = user.change_email(email("c@d.org"), Utc::now()).unwrap_err();
        assert!(matches!(err, AuthenticationError::EmailUnchanged(_)));
        assert_eq!(user.aggregate_version(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_creation_conflicts() {
        let store = InMemoryEventStore::new("user_events", DomainEventsPublisher::new(16));

        let mut first = User::create(AggregateId::from("u1"), email("a@b.com"), Utc::now()).unwrap();
        let mut second = User::create(AggregateId::from("u1"), email("a@b.com"), Utc::now()).unwrap();

        let stream = first.reset_events();
        store.store_events(&stream, 0).await.unwrap();
        first.root_mut().mark_persisted(stream.last_version().unwrap());
        assert_eq!(first.persisted_version(), 1);

        let err = store.store_events(&second.reset_events(), 0).await.unwrap_err();
        match err {
            EventSourcingError::OptimisticConcurrency(conflict) => {
                assert_eq!(conflict.expected_version, 0);
                assert_eq!(conflict.last_event_version, 1);
                assert_eq!(conflict.event_name, "authentication.user:created");
            }
            other => panic!("expected a concurrency conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rebuild_from_store() {
        let store = InMemoryEventStore::new("user_events", DomainEventsPublisher::new(16));
        let mut user = User::create(AggregateId::from("u1"), email("a@b.com"), Utc::now()).unwrap();
        user.change_email(email("c@d.org"), Utc::now()).unwrap();
        store.store_events(&user.reset_events(), 0).await.unwrap();

        let events = store.get_events_for_aggregate(&AggregateId::from("u1"), None).await.unwrap();
        let rebuilt = User::build_from(&events, None).unwrap();

        assert_eq!(rebuilt.serialize_state(), user.serialize_state());
        assert_eq!(rebuilt.persisted_version(), 2);
    }
}
