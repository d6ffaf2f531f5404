// ============================================================================
// Error Categories
// ============================================================================
//
// Every error that can cross a service boundary declares a category. The
// RPC layer turns the category into a status code and decides whether the
// failure is worth retrying.
//
// ============================================================================

/// Coarse classification of a failure as seen by a remote caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Lost a race with another writer; reload and try again.
    Aborted,
    /// The request itself is malformed.
    InvalidArgument,
    NotFound,
    AlreadyExists,
    /// A collaborator (database, broker) is unreachable.
    Unavailable,
    /// Corrupted data or a programming error.
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Aborted => "aborted",
            ErrorCategory::InvalidArgument => "invalid_argument",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::AlreadyExists => "already_exists",
            ErrorCategory::Unavailable => "unavailable",
            ErrorCategory::Internal => "internal",
        }
    }
}

/// Errors that know their category.
pub trait ServiceError: std::error::Error {
    fn category(&self) -> ErrorCategory;

    /// Only optimistic-concurrency conflicts are expected to clear up on
    /// their own after a reload.
    fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom(ErrorCategory);

    impl ServiceError for Boom {
        fn category(&self) -> ErrorCategory {
            self.0
        }
    }

    #[test]
    fn test_only_aborted_is_transient() {
        assert!(Boom(ErrorCategory::Aborted).is_transient());
        assert!(!Boom(ErrorCategory::Internal).is_transient());
        assert!(!Boom(ErrorCategory::InvalidArgument).is_transient());
        assert!(!Boom(ErrorCategory::Unavailable).is_transient());
    }
}
