//! Worker-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use batchline_common::{BatchErrorCode, TransitionError};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by a [`BatchStore`](crate::store::BatchStore) or
/// [`BatchCatalog`](crate::store::BatchCatalog).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The caller no longer holds the claim on this batch.
    #[error("lease lost on batch {batch_id}")]
    LeaseLost { batch_id: Uuid },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("batch {0} not found")]
    NotFound(Uuid),

    /// A stored value could not be mapped back onto the domain types.
    #[error("corrupt {table} row: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

impl StoreError {
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, StoreError::LeaseLost { .. })
    }
}

/// Errors raised while opening a source object.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("invalid source path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("source '{path}' not found")]
    NotFound { path: String },

    #[error("failed to open source '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object store error for '{path}': {message}")]
    ObjectStore { path: String, message: String },
}

/// Errors that abort a pipeline run without a terminal state transition.
///
/// Terminal batch failures are not errors; they come back as
/// [`PipelineOutcome::Failed`](crate::pipeline::PipelineOutcome::Failed).
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Open(#[from] SourceError),

    #[error("source stream failed after row {row_index}: {source}")]
    Read {
        row_index: i64,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, PipelineError::Store(e) if e.is_lease_lost())
    }

    /// Code recorded on the still-claimed batch, if this failure is a source problem.
    pub fn attempt_error_code(&self) -> Option<BatchErrorCode> {
        match self {
            PipelineError::Open(_) | PipelineError::Read { .. } => {
                Some(BatchErrorCode::SourceReadFailed)
            }
            PipelineError::Store(_) => None,
        }
    }
}

/// Errors returned by the status API
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone()),
            ApiError::Store(StoreError::NotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("batch {id} not found"))
            }
            ApiError::Store(ref e) => {
                tracing::error!("Store error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "A storage error occurred".to_string())
            }
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use batchline_common::BatchStatus;

    #[test]
    fn test_source_failures_map_to_read_failed() {
        let err = PipelineError::Open(SourceError::NotFound {
            path: "uploads/a.csv".into(),
        });
        assert_eq!(err.attempt_error_code(), Some(BatchErrorCode::SourceReadFailed));
        assert!(!err.is_lease_lost());
    }

    #[test]
    fn test_lease_lost_is_detected_through_pipeline() {
        let err = PipelineError::from(StoreError::LeaseLost {
            batch_id: Uuid::nil(),
        });
        assert!(err.is_lease_lost());
        assert_eq!(err.attempt_error_code(), None);
    }

    #[test]
    fn test_transition_error_converts() {
        let err: StoreError = BatchStatus::Failed
            .transition(BatchStatus::Claimable)
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
    }

    #[test]
    fn test_api_not_found_status() {
        let response = ApiError::Store(StoreError::NotFound(Uuid::nil())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
