//! Domain types shared across Batchline
//!
//! Everything here is storage-agnostic: the string forms returned by
//! `as_str()` are exactly what is persisted in the `status`, `outcome` and
//! `*_error_code` columns.

mod codes;
mod status;

pub use codes::{BatchErrorCode, RowErrorCode};
pub use status::{BatchStatus, RowOutcome, TransitionError};
