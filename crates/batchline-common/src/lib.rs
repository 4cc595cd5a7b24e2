//! Batchline Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared vocabulary for the batch ingestion workspace.
//!
//! # Overview
//!
//! This crate holds the pieces every workspace member (and any downstream
//! reader of the ingestion tables) must agree on:
//!
//! - **Types**: the batch lifecycle state machine, staged-row outcomes and the
//!   machine-readable error codes written to storage
//! - **Error Handling**: the common error type and result alias
//! - **Logging**: tracing subscriber setup driven by `LOG_*` variables
//!
//! # Example
//!
//! ```
//! use batchline_common::types::BatchStatus;
//!
//! let next = BatchStatus::Claimable.transition(BatchStatus::Claimed).unwrap();
//! assert_eq!(next, BatchStatus::Claimed);
//! assert!(BatchStatus::Failed.transition(BatchStatus::Claimable).is_err());
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{BatchlineError, Result};
pub use types::{BatchErrorCode, BatchStatus, RowErrorCode, RowOutcome, TransitionError};
