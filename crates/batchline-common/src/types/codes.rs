//! Machine-readable error codes

use serde::{Deserialize, Serialize};

/// Batch-level failure codes, written to `last_error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchErrorCode {
    /// The source held more rows than the admission ceiling allows.
    RowLimitExceeded,
    /// The reaper found a stale claim with no attempts left.
    MaxAttemptsExhausted,
    /// The source has no header row.
    EmptySource,
    /// The source could not be parsed for a reason other than transport.
    MalformedSource,
    /// Opening or streaming the source failed at the transport level.
    SourceReadFailed,
    /// The reaper reset a claim whose heartbeat went stale.
    LeaseExpired,
}

impl BatchErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchErrorCode::RowLimitExceeded => "ROW_LIMIT_EXCEEDED",
            BatchErrorCode::MaxAttemptsExhausted => "MAX_ATTEMPTS_EXHAUSTED",
            BatchErrorCode::EmptySource => "EMPTY_SOURCE",
            BatchErrorCode::MalformedSource => "MALFORMED_SOURCE",
            BatchErrorCode::SourceReadFailed => "SOURCE_READ_FAILED",
            BatchErrorCode::LeaseExpired => "LEASE_EXPIRED",
        }
    }

    /// Codes that end the batch. The others only annotate a batch that stays claimed
    /// or goes back to the pool.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchErrorCode::RowLimitExceeded
                | BatchErrorCode::MaxAttemptsExhausted
                | BatchErrorCode::EmptySource
                | BatchErrorCode::MalformedSource
        )
    }
}

impl std::fmt::Display for BatchErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-row validation codes, written to `ingest_staged_records.error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowErrorCode {
    MissingRequiredField,
    ValueTooLong,
    InvalidEmail,
    InvalidPhone,
    InvalidDate,
    InvalidNumber,
    ColumnCountMismatch,
    UnparsableRow,
}

impl RowErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowErrorCode::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            RowErrorCode::ValueTooLong => "VALUE_TOO_LONG",
            RowErrorCode::InvalidEmail => "INVALID_EMAIL",
            RowErrorCode::InvalidPhone => "INVALID_PHONE",
            RowErrorCode::InvalidDate => "INVALID_DATE",
            RowErrorCode::InvalidNumber => "INVALID_NUMBER",
            RowErrorCode::ColumnCountMismatch => "COLUMN_COUNT_MISMATCH",
            RowErrorCode::UnparsableRow => "UNPARSABLE_ROW",
        }
    }
}

impl std::fmt::Display for RowErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
