use thiserror::Error;

use crate::types::TimerState;

/// Errors surfaced by the timer service and its reference collaborators.
#[derive(Debug, Error)]
pub enum TimerError {
    /// Bad argument: negative duration, inverted schedule bounds, …
    #[error("Invalid argument: {0}")]
    Validation(String),

    /// Service not started, or called from a lifecycle callback.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The timer was already canceled or has expired.
    #[error("Timer {id} is {state}")]
    IllegalTimerState { id: String, state: TimerState },

    /// No live timer matches the handle.
    #[error("Timer not found: {id}")]
    NotFound { id: String },

    /// The persistence store rejected a write or a load.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// The transaction refused the completion callback.
    #[error("Transaction registration failed: {0}")]
    TransactionRegistration(String),

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The execution pool did not accept a timeout job.
    #[error("Executor error: {0}")]
    Executor(String),
}

impl TimerError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            TimerError::Validation(_) => "VALIDATION_ERROR",
            TimerError::IllegalState(_) => "ILLEGAL_STATE",
            TimerError::IllegalTimerState { .. } => "ILLEGAL_TIMER_STATE",
            TimerError::NotFound { .. } => "NOT_FOUND",
            TimerError::Persistence(_) => "PERSISTENCE_FAILURE",
            TimerError::TransactionRegistration(_) => "TX_REGISTRATION_FAILURE",
            TimerError::Database(_) => "DATABASE_ERROR",
            TimerError::Serialization(_) => "SERIALIZATION_ERROR",
            TimerError::Executor(_) => "EXECUTOR_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TimerError>;
