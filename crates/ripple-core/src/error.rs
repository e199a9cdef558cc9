use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced to callers of reactive functions.
///
/// Cache and delivery failures never appear here: those layers recover
/// locally and degrade to a cache miss or a dropped notification.
#[derive(Debug, Error)]
pub enum ReactiveError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Reactive function not found: {0}")]
    NotFound(String),

    #[error("Reactive function already registered: {0}")]
    DuplicateName(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Data store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid function definition: {0}")]
    Definition(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReactiveError {
    /// Create a new Validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new NotFound error
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create a new DuplicateName error
    pub fn duplicate_name(name: impl Into<String>) -> Self {
        Self::DuplicateName(name.into())
    }

    /// Create a new Handler error
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Create a new Definition error
    pub fn definition(message: impl Into<String>) -> Self {
        Self::Definition(message.into())
    }

    /// Check if this error is a client error (4xx category). Undecodable
    /// input surfaces as Validation; Serialization is an encoding fault on
    /// our side.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound(_))
    }

    /// Check if this error is a server error (5xx category)
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::DuplicateName(_) => ErrorCategory::Conflict,
            Self::Handler(_) => ErrorCategory::Handler,
            Self::Store(_) => ErrorCategory::Store,
            Self::Definition(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Conflict,
    Handler,
    Store,
    Serialization,
    Configuration,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Handler => write!(f, "handler"),
            Self::Store => write!(f, "store"),
            Self::Serialization => write!(f, "serialization"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

/// Convenience result type for reactive operations
pub type Result<T> = std::result::Result<T, ReactiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ReactiveError::validation("title must not be empty");
        assert_eq!(err.to_string(), "Validation error: title must not be empty");
        assert!(err.is_client_error());
        assert!(!err.is_server_error());
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[test]
    fn test_not_found_error() {
        let err = ReactiveError::not_found("posts.getAll");
        assert_eq!(err.to_string(), "Reactive function not found: posts.getAll");
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    #[test]
    fn test_store_error_is_server_error() {
        let err: ReactiveError = StoreError::Transaction("deadlock".into()).into();
        assert!(err.is_server_error());
        assert_eq!(err.category(), ErrorCategory::Store);
    }

    #[test]
    fn test_serialization_error_is_server_error() {
        let err: ReactiveError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(err.is_server_error());
        assert_eq!(err.category(), ErrorCategory::Serialization);
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::Conflict.to_string(), "conflict");
        assert_eq!(ErrorCategory::Handler.to_string(), "handler");
    }
}
