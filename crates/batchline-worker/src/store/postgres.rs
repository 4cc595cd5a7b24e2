//! Postgres store
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers pass over each
//! other's candidate rows instead of queueing behind them. Reaping is two
//! plain conditional updates that converge no matter how many workers run
//! them at once. Every lease-guarded write matches on status, owner and
//! attempt, and a miss is explained by reading the row back.

use async_trait::async_trait;
use batchline_common::{BatchErrorCode, BatchStatus, BatchlineError, RowOutcome, TransitionError};
use chrono::{DateTime, Utc};
use sqlx::{types::Json, FromRow, PgPool};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{unmatched_write, BatchCatalog, BatchStore, ChunkReceipt};
use crate::batch::{Batch, ClaimedBatch, NewBatch, PersistedRow, StagedRow};
use crate::error::{StoreError, StoreResult};
use crate::lease::{ReapPolicy, ReapReport};
use crate::outcome::OutcomeSummary;

const CLAIM_SQL: &str = r#"
WITH next AS (
    SELECT id
    FROM ingest_batches
    WHERE status = 'claimable'
    ORDER BY created_at, id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE ingest_batches b
SET
    status = 'claimed',
    claimed_by = $1,
    claimed_at = NOW(),
    heartbeat_at = NOW(),
    attempt_count = b.attempt_count + 1
FROM next
WHERE b.id = next.id
RETURNING b.id, b.tenant_id, b.source_path, b.attempt_count, b.claimed_at
"#;

const REAP_RESET_SQL: &str = r#"
UPDATE ingest_batches
SET
    status = 'claimable',
    claimed_by = NULL,
    claimed_at = NULL,
    heartbeat_at = NULL,
    last_error_code = 'LEASE_EXPIRED',
    last_error_at = NOW()
WHERE status = 'claimed'
    AND heartbeat_at < NOW() - make_interval(secs => $1)
    AND attempt_count < $2
"#;

// SET expressions read the pre-update row, so claimed_by is still the last owner.
const REAP_EXHAUST_SQL: &str = r#"
UPDATE ingest_batches
SET
    status = 'failed',
    last_error_code = 'MAX_ATTEMPTS_EXHAUSTED',
    last_error_at = NOW(),
    outcome_summary = jsonb_build_object(
        'status', 'failed',
        'attempt', attempt_count,
        'worker_id', NULL::text,
        'last_claimed_by', claimed_by,
        'counts', NULL::jsonb,
        'error', jsonb_build_object(
            'code', 'MAX_ATTEMPTS_EXHAUSTED',
            'message', format(
                'heartbeat went stale after %s attempts (last owner %s)',
                attempt_count,
                COALESCE(claimed_by, 'unknown')
            )
        ),
        'finished_at', NOW()
    ),
    claimed_by = NULL,
    claimed_at = NULL,
    heartbeat_at = NULL
WHERE status = 'claimed'
    AND heartbeat_at < NOW() - make_interval(secs => $1)
    AND attempt_count >= $2
"#;

const LEASE_TENANT_SQL: &str = r#"
SELECT tenant_id
FROM ingest_batches
WHERE id = $1 AND status = 'claimed' AND claimed_by = $2 AND attempt_count = $3
FOR SHARE
"#;

const INSERT_CHUNK_SQL: &str = r#"
INSERT INTO ingest_staged_records (
    batch_id, row_index, tenant_id, outcome, payload, raw, error_code, error_detail
)
SELECT $1, r.row_index, $2, r.outcome, r.payload::jsonb, r.raw::jsonb, r.error_code, r.error_detail
FROM UNNEST($3::bigint[], $4::text[], $5::text[], $6::text[], $7::text[], $8::text[])
    AS r(row_index, outcome, payload, raw, error_code, error_detail)
ON CONFLICT (batch_id, row_index) DO NOTHING
"#;

const HEARTBEAT_SQL: &str = r#"
UPDATE ingest_batches
SET heartbeat_at = NOW()
WHERE id = $1 AND status = 'claimed' AND claimed_by = $2 AND attempt_count = $3
"#;

const FINISH_SQL: &str = r#"
UPDATE ingest_batches
SET
    status = $4,
    outcome_summary = $5,
    last_error_code = COALESCE($6, last_error_code),
    last_error_at = CASE WHEN $6 IS NULL THEN last_error_at ELSE NOW() END,
    claimed_by = NULL,
    claimed_at = NULL,
    heartbeat_at = NULL
WHERE id = $1 AND status = 'claimed' AND claimed_by = $2 AND attempt_count = $3
"#;

const ATTEMPT_ERROR_SQL: &str = r#"
UPDATE ingest_batches
SET last_error_code = $4, last_error_at = NOW()
WHERE id = $1 AND status = 'claimed' AND claimed_by = $2 AND attempt_count = $3
"#;

#[derive(Debug, FromRow)]
struct BatchRow {
    id: Uuid,
    tenant_id: Uuid,
    source_path: String,
    status: String,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    attempt_count: i32,
    last_error_at: Option<DateTime<Utc>>,
    last_error_code: Option<String>,
    total_rows: i64,
    outcome_summary: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BatchRow> for Batch {
    type Error = StoreError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        let status = parse_status(&row.status)?;
        Ok(Batch {
            id: row.id,
            tenant_id: row.tenant_id,
            source_path: row.source_path,
            status,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            heartbeat_at: row.heartbeat_at,
            attempt_count: row.attempt_count,
            last_error_at: row.last_error_at,
            last_error_code: row.last_error_code,
            total_rows: row.total_rows,
            outcome_summary: row.outcome_summary,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct StagedRecordRow {
    batch_id: Uuid,
    row_index: i64,
    tenant_id: Uuid,
    outcome: String,
    payload: Option<serde_json::Value>,
    raw: Option<serde_json::Value>,
    error_code: Option<String>,
    error_detail: Option<String>,
}

impl TryFrom<StagedRecordRow> for PersistedRow {
    type Error = StoreError;

    fn try_from(row: StagedRecordRow) -> Result<Self, Self::Error> {
        let outcome = row.outcome.parse::<RowOutcome>().map_err(|e: BatchlineError| {
            StoreError::CorruptRow {
                table: "ingest_staged_records",
                reason: e.to_string(),
            }
        })?;
        Ok(PersistedRow {
            batch_id: row.batch_id,
            row_index: row.row_index,
            tenant_id: row.tenant_id,
            outcome,
            payload: row.payload,
            raw: row.raw,
            error_code: row.error_code,
            error_detail: row.error_detail,
        })
    }
}

fn parse_status(raw: &str) -> StoreResult<BatchStatus> {
    raw.parse::<BatchStatus>().map_err(|e: BatchlineError| StoreError::CorruptRow {
        table: "ingest_batches",
        reason: e.to_string(),
    })
}

/// Chunk columns laid out for `UNNEST`.
#[derive(Default)]
struct ChunkColumns {
    row_index: Vec<i64>,
    outcome: Vec<String>,
    payload: Vec<Option<String>>,
    raw: Vec<Option<String>>,
    error_code: Vec<Option<String>>,
    error_detail: Vec<Option<String>>,
}

impl ChunkColumns {
    fn from_rows(rows: &[StagedRow]) -> StoreResult<Self> {
        let mut columns = ChunkColumns::default();
        for row in rows {
            columns.row_index.push(row.row_index);
            columns.outcome.push(row.outcome().as_str().to_string());
            columns
                .payload
                .push(row.payload().map(serde_json::to_string).transpose()?);
            columns
                .raw
                .push(row.raw.as_ref().map(serde_json::to_string).transpose()?);
            let (code, detail) = match row.error() {
                Some((code, detail)) => (Some(code.as_str().to_string()), Some(detail.to_string())),
                None => (None, None),
            };
            columns.error_code.push(code);
            columns.error_detail.push(detail);
        }
        Ok(columns)
    }
}

/// Store backed by the `ingest_batches` and `ingest_staged_records` tables.
#[derive(Clone)]
pub struct PgBatchStore {
    pool: PgPool,
}

impl PgBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_status(&self, id: Uuid) -> StoreResult<BatchStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM ingest_batches WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match status {
            Some(status) => parse_status(&status),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn finish(
        &self,
        lease: &ClaimedBatch,
        target: BatchStatus,
        code: Option<BatchErrorCode>,
        summary: &OutcomeSummary,
    ) -> StoreResult<()> {
        BatchStatus::Claimed.transition(target)?;

        let result = sqlx::query(FINISH_SQL)
            .bind(lease.id)
            .bind(&lease.worker_id)
            .bind(lease.attempt)
            .bind(target.as_str())
            .bind(Json(summary))
            .bind(code.map(|c| c.as_str()))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let current = self.current_status(lease.id).await?;
            return Err(unmatched_write(lease.id, current, target));
        }

        info!(batch_id = %lease.id, status = %target, "Batch finished");
        Ok(())
    }
}

#[async_trait]
impl BatchStore for PgBatchStore {
    #[instrument(skip(self))]
    async fn claim(&self, worker_id: &str) -> StoreResult<Option<ClaimedBatch>> {
        BatchStatus::Claimable.transition(BatchStatus::Claimed)?;

        let claimed: Option<(Uuid, Uuid, String, i32, DateTime<Utc>)> =
            sqlx::query_as(CLAIM_SQL)
                .bind(worker_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(claimed.map(|(id, tenant_id, source_path, attempt, claimed_at)| {
            debug!(batch_id = %id, attempt, "Claimed batch");
            ClaimedBatch {
                id,
                tenant_id,
                source_path,
                worker_id: worker_id.to_string(),
                attempt,
                claimed_at,
            }
        }))
    }

    #[instrument(skip(self))]
    async fn reap(&self, policy: &ReapPolicy) -> StoreResult<ReapReport> {
        let stale_secs = policy.stale_after.as_secs_f64();

        let reset = sqlx::query(REAP_RESET_SQL)
            .bind(stale_secs)
            .bind(policy.max_attempts)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let exhausted = sqlx::query(REAP_EXHAUST_SQL)
            .bind(stale_secs)
            .bind(policy.max_attempts)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let report = ReapReport { reset, exhausted };
        if !report.is_empty() {
            info!(reset, exhausted, "Reaped stale claims");
        }
        Ok(report)
    }

    #[instrument(skip(self, lease, rows), fields(batch_id = %lease.id, rows = rows.len()))]
    async fn write_chunk(
        &self,
        lease: &ClaimedBatch,
        rows: &[StagedRow],
    ) -> StoreResult<ChunkReceipt> {
        let columns = ChunkColumns::from_rows(rows)?;
        let highest = columns.row_index.iter().copied().max().unwrap_or(0);

        let mut tx = self.pool.begin().await?;

        // The tenant comes from the batch row, never from the caller.
        let tenant_id: Option<Uuid> = sqlx::query_scalar(LEASE_TENANT_SQL)
            .bind(lease.id)
            .bind(&lease.worker_id)
            .bind(lease.attempt)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(tenant_id) = tenant_id else {
            return Err(StoreError::LeaseLost { batch_id: lease.id });
        };

        let inserted = sqlx::query(INSERT_CHUNK_SQL)
            .bind(lease.id)
            .bind(tenant_id)
            .bind(&columns.row_index)
            .bind(&columns.outcome)
            .bind(&columns.payload)
            .bind(&columns.raw)
            .bind(&columns.error_code)
            .bind(&columns.error_detail)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let total_rows: i64 = sqlx::query_scalar(
            "UPDATE ingest_batches SET total_rows = GREATEST(total_rows, $2) WHERE id = $1 RETURNING total_rows",
        )
        .bind(lease.id)
        .bind(highest)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(inserted, total_rows, "Chunk written");
        Ok(ChunkReceipt {
            inserted,
            total_rows,
        })
    }

    async fn heartbeat(&self, lease: &ClaimedBatch) -> StoreResult<()> {
        let result = sqlx::query(HEARTBEAT_SQL)
            .bind(lease.id)
            .bind(&lease.worker_id)
            .bind(lease.attempt)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost { batch_id: lease.id });
        }
        Ok(())
    }

    async fn complete(
        &self,
        lease: &ClaimedBatch,
        summary: &OutcomeSummary,
    ) -> StoreResult<()> {
        self.finish(lease, BatchStatus::Staged, None, summary).await
    }

    async fn fail(
        &self,
        lease: &ClaimedBatch,
        code: BatchErrorCode,
        summary: &OutcomeSummary,
    ) -> StoreResult<()> {
        self.finish(lease, BatchStatus::Failed, Some(code), summary).await
    }

    async fn record_attempt_error(
        &self,
        lease: &ClaimedBatch,
        code: BatchErrorCode,
    ) -> StoreResult<()> {
        let result = sqlx::query(ATTEMPT_ERROR_SQL)
            .bind(lease.id)
            .bind(&lease.worker_id)
            .bind(lease.attempt)
            .bind(code.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost { batch_id: lease.id });
        }
        Ok(())
    }
}

#[async_trait]
impl BatchCatalog for PgBatchStore {
    #[instrument(skip(self))]
    async fn create_batch(&self, new: NewBatch) -> StoreResult<Batch> {
        let row: BatchRow = sqlx::query_as(
            r#"
            INSERT INTO ingest_batches (id, tenant_id, source_path, status)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.tenant_id)
        .bind(&new.source_path)
        .bind(BatchStatus::Created.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    #[instrument(skip(self))]
    async fn mark_claimable(&self, id: Uuid) -> StoreResult<Batch> {
        let row: Option<BatchRow> = sqlx::query_as(
            "UPDATE ingest_batches SET status = 'claimable' WHERE id = $1 AND status = 'created' RETURNING *",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                let current = self.current_status(id).await?;
                Err(StoreError::InvalidTransition(TransitionError {
                    from: current,
                    to: BatchStatus::Claimable,
                }))
            }
        }
    }

    async fn get_batch(&self, id: Uuid) -> StoreResult<Option<Batch>> {
        let row: Option<BatchRow> = sqlx::query_as("SELECT * FROM ingest_batches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Batch::try_from).transpose()
    }

    async fn staged_rows(&self, id: Uuid) -> StoreResult<Vec<PersistedRow>> {
        let rows: Vec<StagedRecordRow> = sqlx::query_as(
            r#"
            SELECT batch_id, row_index, tenant_id, outcome, payload, raw, error_code, error_detail
            FROM ingest_staged_records
            WHERE batch_id = $1
            ORDER BY row_index
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PersistedRow::try_from).collect()
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
