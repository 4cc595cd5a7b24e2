//! Batch lifecycle state machine

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::BatchlineError;

/// Lifecycle state of an ingestion batch.
///
/// The only legal moves are:
///
/// ```text
/// created -> claimable -> claimed -> staged
///                  ^          |
///                  +----------+ (stale lease reset)
///                             |
///                             +-> failed
/// ```
///
/// `Staged` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Created,
    Claimable,
    Claimed,
    Staged,
    Failed,
}

/// Rejected attempt to move a batch between two states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid batch transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: BatchStatus,
    pub to: BatchStatus,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 5] = [
        BatchStatus::Created,
        BatchStatus::Claimable,
        BatchStatus::Claimed,
        BatchStatus::Staged,
        BatchStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Created => "created",
            BatchStatus::Claimable => "claimable",
            BatchStatus::Claimed => "claimed",
            BatchStatus::Staged => "staged",
            BatchStatus::Failed => "failed",
        }
    }

    /// Whether the transition table contains `self -> next`.
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::{Claimable, Claimed, Created, Failed, Staged};

        matches!(
            (self, next),
            (Created, Claimable)
                | (Claimable, Claimed)
                | (Claimed, Staged)
                | (Claimed, Claimable)
                | (Claimed, Failed)
        )
    }

    /// Validate `self -> next`, returning the new state.
    pub fn transition(self, next: BatchStatus) -> Result<BatchStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Staged | BatchStatus::Failed)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored values are parsed strictly; an unknown string is an error, never a default.
impl std::str::FromStr for BatchStatus {
    type Err = BatchlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BatchlineError::UnknownStatus(s.to_string()))
    }
}

/// Classification of a single staged row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOutcome {
    Admissible,
    Rejected,
}

impl RowOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowOutcome::Admissible => "admissible",
            RowOutcome::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for RowOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RowOutcome {
    type Err = BatchlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admissible" => Ok(RowOutcome::Admissible),
            "rejected" => Ok(RowOutcome::Rejected),
            other => Err(BatchlineError::UnknownOutcome(other.to_string())),
        }
    }
}
