use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::errors::AuthenticationError;
use super::session::Session;
use super::user::{Email, User};
use super::user_view::UserView;
use crate::event_sourcing::core::{Aggregate, AggregateId};
use crate::event_sourcing::store::AggregateRepository;

// ============================================================================
// Authentication use cases
// ============================================================================
//
// Each `execute` is one attempt: load, decide, save. Callers run them under
// a CommandRunner so optimistic-concurrency conflicts get a fresh attempt.
// Email uniqueness is checked against the UserView and is therefore only as
// fresh as the projection.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SignUpOutcome {
    pub user_id: AggregateId,
    pub session_id: AggregateId,
    /// False when the email already belonged to a user.
    pub user_created: bool,
}

pub struct EmailSignUp {
    users: AggregateRepository<User>,
    sessions: AggregateRepository<Session>,
    view: Arc<UserView>,
}

impl EmailSignUp {
    pub fn new(users: AggregateRepository<User>, sessions: AggregateRepository<Session>, view: Arc<UserView>) -> Self {
        Self { users, sessions, view }
    }

    pub async fn execute(&self, email: &str) -> Result<SignUpOutcome, AuthenticationError> {
        let email = Email::parse(email)?;
        let now = Utc::now();

        let (user_id, user_created) = match self.view.find_by_email(email.as_str()).await? {
            Some(existing) => (existing.user_id, false),
            None => {
                let mut user = User::create(new_id(), email.clone(), now)?;
                self.users.save(&mut user).await?;
                (user.id().clone(), true)
            }
        };

        let mut session = Session::request_sign_up(new_id(), user_id.clone(), email, now)?;
        self.sessions.save(&mut session).await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id(),
            user_created = user_created,
            "Sign-up requested"
        );

        Ok(SignUpOutcome {
            user_id,
            session_id: session.id().clone(),
            user_created,
        })
    }
}

pub struct ChangeEmail {
    users: AggregateRepository<User>,
    view: Arc<UserView>,
}

impl ChangeEmail {
    pub fn new(users: AggregateRepository<User>, view: Arc<UserView>) -> Self {
        Self { users, view }
    }

    /// Returns the new aggregate version.
    pub async fn execute(&self, user_id: &AggregateId, email: &str) -> Result<u64, AuthenticationError> {
        let email = Email::parse(email)?;

        if let Some(owner) = self.view.find_by_email(email.as_str()).await? {
            if &owner.user_id != user_id {
                return Err(AuthenticationError::EmailTaken(email.to_string()));
            }
        }

        let mut user = self
            .users
            .load(user_id)
            .await?
            .ok_or_else(|| AuthenticationError::UserNotFound(user_id.clone()))?;

        user.change_email(email, Utc::now())?;
        self.users.save(&mut user).await?;

        tracing::info!(user_id = %user_id, version = user.aggregate_version(), "Email changed");
        Ok(user.aggregate_version())
    }
}

fn new_id() -> AggregateId {
    AggregateId::from(Uuid::now_v7().to_string())
}
