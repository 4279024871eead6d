//! Domain error types
//!
//! These errors represent business logic failures, distinct from infrastructure errors.
//! Using thiserror for ergonomic error handling with proper Display implementations.

use thiserror::Error;

/// Errors related to session lifecycle operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// The home session is reserved
    #[error("The home session cannot be deleted")]
    CannotDeleteIndex,

    /// Id generation kept colliding with persisted sessions
    #[error("Could not generate a unique session id after {attempts} attempts")]
    IdExhausted { attempts: usize },

    /// Storage error (wraps infrastructure errors)
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Errors raised while constructing or driving the session store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store spawns background tasks and needs a Tokio runtime
    #[error("Session store must be created inside a Tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Errors surfaced by token counters
#[derive(Debug, Error)]
pub enum CounterError {
    /// The worker running the tokenizer went away
    #[error("Token counter worker failed: {0}")]
    WorkerFailed(String),

    /// Tokenizer error
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
}

impl From<anyhow::Error> for SessionError {
    fn from(err: anyhow::Error) -> Self {
        SessionError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Session(SessionError::from(err))
    }
}
