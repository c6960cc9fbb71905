//! Error types for Hive
//!
//! Every crate in the workspace reports failures through this enum.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Hive error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Storage
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // ========================================================================
    // Task lifecycle
    // ========================================================================
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Task error: {0}")]
    Task(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Container error: {0}")]
    Container(String),

    // ========================================================================
    // External collaborators
    // ========================================================================
    #[error("Collaborator error: {message}")]
    Collaborator { message: String, transient: bool },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // ========================================================================
    // Execution
    // ========================================================================
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // Cron
    // ========================================================================
    #[error("Cron error: {0}")]
    Cron(String),

    // ========================================================================
    // General
    // ========================================================================
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::RateLimited(_) => true,
            Error::Collaborator { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Whether this error represents an intentional interruption rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Transient collaborator error (timeout- or rate-limit-shaped)
    pub fn transient(message: impl Into<String>) -> Self {
        Error::Collaborator {
            message: message.into(),
            transient: true,
        }
    }

    /// Permanent collaborator error
    pub fn collaborator(message: impl Into<String>) -> Self {
        Error::Collaborator {
            message: message.into(),
            transient: false,
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout("slow".into()).is_retryable());
        assert!(Error::RateLimited("429".into()).is_retryable());
        assert!(Error::transient("overloaded").is_retryable());
        assert!(!Error::collaborator("bad request").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(Error::Cancelled.is_cancellation());
    }

    #[test]
    fn test_transition_message() {
        let err = Error::invalid_transition("completed", "in-progress");
        assert_eq!(
            err.to_string(),
            "Invalid status transition: completed -> in-progress"
        );
    }
}
