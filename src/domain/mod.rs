// ============================================================================
// Authentication domain
// ============================================================================
//
// Users and sign-up sessions as event-sourced aggregates, the contracts they
// publish, a query view fed by a projector, and the use cases that tie them
// together. Only the event sourcing and messaging layers are depended on;
// nothing here knows about Postgres or Kafka.
//
// ============================================================================

pub mod contracts;
pub mod errors;
pub mod session;
pub mod usecases;
pub mod user;
pub mod user_view;

pub use errors::AuthenticationError;
pub use session::Session;
pub use usecases::{ChangeEmail, EmailSignUp, SignUpOutcome};
pub use user::{Email, User};
pub use user_view::{
    user_view_projector, InMemoryUserViewStore, PostgresUserViewStore, UserView, UserViewRecord, UserViewStore,
};
