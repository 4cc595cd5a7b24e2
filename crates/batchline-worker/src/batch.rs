//! Batch and staged-row records

use batchline_common::{BatchStatus, RowErrorCode, RowOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work as stored in `ingest_batches`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub source_path: String,
    pub status: BatchStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub total_rows: i64,
    pub outcome_summary: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering a new batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBatch {
    pub tenant_id: Uuid,
    pub source_path: String,
}

/// Proof of ownership handed out by a successful claim.
///
/// Every write made on behalf of a batch is guarded by the worker id and
/// attempt number recorded here. Once the batch is reaped, or re-claimed by
/// anyone (including the same worker), the lease is dead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedBatch {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub source_path: String,
    pub worker_id: String,
    pub attempt: i32,
    pub claimed_at: DateTime<Utc>,
}

/// Validation result for one source row.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Admissible { payload: serde_json::Value },
    Rejected { code: RowErrorCode, detail: String },
}

/// A classified row waiting to be written.
///
/// There is no tenant field; the store takes the tenant from the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub row_index: i64,
    pub classification: Classification,
    /// Original cells keyed by header, absent when the row could not be decoded.
    pub raw: Option<serde_json::Value>,
}

impl StagedRow {
    pub fn outcome(&self) -> RowOutcome {
        match self.classification {
            Classification::Admissible { .. } => RowOutcome::Admissible,
            Classification::Rejected { .. } => RowOutcome::Rejected,
        }
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        match &self.classification {
            Classification::Admissible { payload } => Some(payload),
            Classification::Rejected { .. } => None,
        }
    }

    pub fn error(&self) -> Option<(RowErrorCode, &str)> {
        match &self.classification {
            Classification::Admissible { .. } => None,
            Classification::Rejected { code, detail } => Some((*code, detail.as_str())),
        }
    }
}

/// A row as persisted in `ingest_staged_records`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRow {
    pub batch_id: Uuid,
    pub row_index: i64,
    pub tenant_id: Uuid,
    pub outcome: RowOutcome,
    pub payload: Option<serde_json::Value>,
    pub raw: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
}

impl PersistedRow {
    pub(crate) fn from_staged(batch_id: Uuid, tenant_id: Uuid, row: &StagedRow) -> Self {
        let (error_code, error_detail) = match row.error() {
            Some((code, detail)) => (Some(code.as_str().to_string()), Some(detail.to_string())),
            None => (None, None),
        };

        Self {
            batch_id,
            row_index: row.row_index,
            tenant_id,
            outcome: row.outcome(),
            payload: row.payload().cloned(),
            raw: row.raw.clone(),
            error_code,
            error_detail,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_persisted_row_carries_supplied_tenant() {
        let tenant = Uuid::new_v4();
        let row = StagedRow {
            row_index: 7,
            classification: Classification::Rejected {
                code: RowErrorCode::InvalidEmail,
                detail: "email: not a valid email address".into(),
            },
            raw: Some(json!({"email": "nope", "tenant_id": "someone-else"})),
        };

        let persisted = PersistedRow::from_staged(Uuid::nil(), tenant, &row);
        assert_eq!(persisted.tenant_id, tenant);
        assert_eq!(persisted.outcome, RowOutcome::Rejected);
        assert_eq!(persisted.error_code.as_deref(), Some("INVALID_EMAIL"));
        assert!(persisted.payload.is_none());
    }
}
