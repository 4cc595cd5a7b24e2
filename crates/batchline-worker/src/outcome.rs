//! Outcome reporting
//!
//! [`OutcomeReporter`] watches every classified row of one pipeline run and
//! produces the [`OutcomeSummary`] written to `outcome_summary` at the
//! terminal transition.

use std::collections::BTreeMap;

use batchline_common::{BatchErrorCode, BatchStatus, RowErrorCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::{ClaimedBatch, StagedRow};

/// Default number of rejected rows kept in the summary sample.
pub const DEFAULT_REJECTED_SAMPLE_SIZE: usize = 25;

/// The document stored in `ingest_batches.outcome_summary`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub status: BatchStatus,
    pub attempt: i32,
    /// Worker that wrote this summary; `None` when written by the reaper.
    pub worker_id: Option<String>,
    pub last_claimed_by: Option<String>,
    /// `None` only when the reaper wrote the summary without seeing any rows.
    pub counts: Option<OutcomeCounts>,
    pub error: Option<OutcomeError>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub total_parsed: u64,
    pub total_admitted: u64,
    pub total_rejected: u64,
    pub rejected_by_code: BTreeMap<String, u64>,
    pub rejected_sample: Vec<RejectedSample>,
    pub sample_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedSample {
    pub row_index: i64,
    pub error_code: RowErrorCode,
    pub error_detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub code: BatchErrorCode,
    pub message: String,
}

impl OutcomeSummary {
    pub fn staged(lease: &ClaimedBatch, counts: OutcomeCounts, finished_at: DateTime<Utc>) -> Self {
        Self {
            status: BatchStatus::Staged,
            attempt: lease.attempt,
            worker_id: Some(lease.worker_id.clone()),
            last_claimed_by: Some(lease.worker_id.clone()),
            counts: Some(counts),
            error: None,
            finished_at,
        }
    }

    pub fn failed(
        lease: &ClaimedBatch,
        counts: OutcomeCounts,
        code: BatchErrorCode,
        message: impl Into<String>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: BatchStatus::Failed,
            attempt: lease.attempt,
            worker_id: Some(lease.worker_id.clone()),
            last_claimed_by: Some(lease.worker_id.clone()),
            counts: Some(counts),
            error: Some(OutcomeError {
                code,
                message: message.into(),
            }),
            finished_at,
        }
    }

    /// Summary written by the reaper when a stale claim has no attempts left.
    pub fn exhausted(
        attempt: i32,
        last_claimed_by: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: BatchStatus::Failed,
            attempt,
            worker_id: None,
            error: Some(OutcomeError {
                code: BatchErrorCode::MaxAttemptsExhausted,
                message: exhausted_message(attempt, last_claimed_by.as_deref()),
            }),
            last_claimed_by,
            counts: None,
            finished_at,
        }
    }
}

/// Message used for exhaustion summaries. The Postgres reaper builds the
/// same text with `format()`.
pub fn exhausted_message(attempt: i32, last_claimed_by: Option<&str>) -> String {
    format!(
        "heartbeat went stale after {attempt} attempts (last owner {})",
        last_claimed_by.unwrap_or("unknown")
    )
}

/// Running tally for one pipeline run.
#[derive(Debug, Clone)]
pub struct OutcomeReporter {
    sample_size: usize,
    total_parsed: u64,
    total_admitted: u64,
    total_rejected: u64,
    rejected_by_code: BTreeMap<String, u64>,
    rejected_sample: Vec<RejectedSample>,
    sample_truncated: bool,
}

impl OutcomeReporter {
    pub fn new(sample_size: usize) -> Self {
        Self {
            sample_size,
            total_parsed: 0,
            total_admitted: 0,
            total_rejected: 0,
            rejected_by_code: BTreeMap::new(),
            rejected_sample: Vec::new(),
            sample_truncated: false,
        }
    }

    pub fn observe(&mut self, row: &StagedRow) {
        self.total_parsed += 1;

        match row.error() {
            None => self.total_admitted += 1,
            Some((code, detail)) => {
                self.total_rejected += 1;
                *self
                    .rejected_by_code
                    .entry(code.as_str().to_string())
                    .or_insert(0) += 1;

                if self.rejected_sample.len() < self.sample_size {
                    self.rejected_sample.push(RejectedSample {
                        row_index: row.row_index,
                        error_code: code,
                        error_detail: detail.to_string(),
                    });
                } else {
                    self.sample_truncated = true;
                }
            }
        }
    }

    pub fn total_parsed(&self) -> u64 {
        self.total_parsed
    }

    pub fn counts(&self) -> OutcomeCounts {
        OutcomeCounts {
            total_parsed: self.total_parsed,
            total_admitted: self.total_admitted,
            total_rejected: self.total_rejected,
            rejected_by_code: self.rejected_by_code.clone(),
            rejected_sample: self.rejected_sample.clone(),
            sample_truncated: self.sample_truncated,
        }
    }
}

impl Default for OutcomeReporter {
    fn default() -> Self {
        Self::new(DEFAULT_REJECTED_SAMPLE_SIZE)
    }
}
