use crate::errors::{ErrorCategory, ServiceError};
use crate::event_sourcing::core::{AggregateId, EventSourcingError};

// ============================================================================
// Authentication Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AuthenticationError {
    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    #[error("User not found: {0}")]
    UserNotFound(AggregateId),

    #[error("User {0} already uses this email")]
    EmailUnchanged(AggregateId),

    #[error("Email {0} belongs to another user")]
    EmailTaken(String),

    #[error(transparent)]
    Store(#[from] EventSourcingError),
}

impl ServiceError for AuthenticationError {
    fn category(&self) -> ErrorCategory {
        match self {
            AuthenticationError::InvalidEmail(_) | AuthenticationError::EmailUnchanged(_) => {
                ErrorCategory::InvalidArgument
            }
            AuthenticationError::UserNotFound(_) => ErrorCategory::NotFound,
            AuthenticationError::EmailTaken(_) => ErrorCategory::AlreadyExists,
            AuthenticationError::Store(e) => e.category(),
        }
    }
}
