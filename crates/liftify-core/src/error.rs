//! Unified error types for Liftify

use thiserror::Error;

/// Unified error type for all Liftify operations
#[derive(Error, Debug)]
pub enum LiftifyError {
    // Input errors (fatal, never retried)
    #[error("Malformed input: {0}")]
    InputShape(String),

    // Dependency errors
    #[error("Transient dependency failure in {operation}: {message}")]
    Transient { operation: String, message: String },

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Run state errors
    #[error("Concurrent modification of run {key}: expected version {expected}, found {found}")]
    ConcurrentModification {
        key: String,
        expected: String,
        found: String,
    },

    #[error("Run {0} already reached a terminal state")]
    RunTerminal(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl LiftifyError {
    /// Build a transient error for the named operation
    pub fn transient(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Whether the failure may succeed when retried at the call site.
    ///
    /// Transient failures never consume the pipeline's retry counter.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Io(_))
    }
}

/// Result type alias using LiftifyError
pub type Result<T> = std::result::Result<T, LiftifyError>;
