//! Error types for Batchline

use thiserror::Error;

use crate::types::TransitionError;

/// Result type alias for Batchline operations
pub type Result<T> = std::result::Result<T, BatchlineError>;

/// Main error type shared by workspace members
#[derive(Error, Debug)]
pub enum BatchlineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Unknown batch status: {0}")]
    UnknownStatus(String),

    #[error("Unknown row outcome: {0}")]
    UnknownOutcome(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
