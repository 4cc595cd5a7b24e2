//! In-process store
//!
//! Same contract as the Postgres store, with a single mutex standing in for
//! row locks. The clock can be moved forward so lease expiry can be exercised
//! without waiting. Used by the test suite and the `dry-run` command.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use batchline_common::{BatchErrorCode, BatchStatus};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{unmatched_write, BatchCatalog, BatchStore, ChunkReceipt};
use crate::batch::{Batch, ClaimedBatch, NewBatch, PersistedRow, StagedRow};
use crate::error::{StoreError, StoreResult};
use crate::lease::{ReapPolicy, ReapReport};
use crate::outcome::OutcomeSummary;

struct Inner {
    batches: HashMap<Uuid, Batch>,
    rows: BTreeMap<(Uuid, i64), PersistedRow>,
    clock_offset: chrono::Duration,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            batches: HashMap::new(),
            rows: BTreeMap::new(),
            clock_offset: chrono::Duration::zero(),
        }
    }
}

impl Inner {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }

    fn batch_mut(&mut self, id: Uuid) -> StoreResult<&mut Batch> {
        self.batches.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    /// The batch, if `lease` still owns it.
    fn leased_mut(&mut self, lease: &ClaimedBatch) -> StoreResult<&mut Batch> {
        let batch = self.batch_mut(lease.id)?;
        if holds(batch, lease) {
            Ok(batch)
        } else {
            Err(StoreError::LeaseLost { batch_id: lease.id })
        }
    }

    /// Move a leased batch to a terminal status.
    fn finish(
        &mut self,
        lease: &ClaimedBatch,
        target: BatchStatus,
        code: Option<BatchErrorCode>,
        summary: &OutcomeSummary,
    ) -> StoreResult<()> {
        let now = self.now();
        let summary = serde_json::to_value(summary)?;
        let batch = self.batch_mut(lease.id)?;

        if !holds(batch, lease) {
            return Err(unmatched_write(lease.id, batch.status, target));
        }

        batch.status = batch.status.transition(target)?;
        release(batch);
        if let Some(code) = code {
            batch.last_error_code = Some(code.as_str().to_string());
            batch.last_error_at = Some(now);
        }
        batch.outcome_summary = Some(summary);
        batch.updated_at = now;
        Ok(())
    }
}

fn holds(batch: &Batch, lease: &ClaimedBatch) -> bool {
    batch.status == BatchStatus::Claimed
        && batch.claimed_by.as_deref() == Some(lease.worker_id.as_str())
        && batch.attempt_count == lease.attempt
}

fn release(batch: &mut Batch) {
    batch.claimed_by = None;
    batch.claimed_at = None;
    batch.heartbeat_at = None;
}

#[derive(Default)]
pub struct MemoryBatchStore {
    inner: Mutex<Inner>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move this store's clock forward.
    pub async fn advance(&self, by: chrono::Duration) {
        let mut inner = self.inner.lock().await;
        inner.clock_offset = inner.clock_offset + by;
    }

    pub async fn now(&self) -> DateTime<Utc> {
        self.inner.lock().await.now()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn claim(&self, worker_id: &str) -> StoreResult<Option<ClaimedBatch>> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();

        let next = inner
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Claimable)
            .min_by_key(|b| (b.created_at, b.id))
            .map(|b| b.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let batch = inner.batch_mut(id)?;
        batch.status = batch.status.transition(BatchStatus::Claimed)?;
        batch.claimed_by = Some(worker_id.to_string());
        batch.claimed_at = Some(now);
        batch.heartbeat_at = Some(now);
        batch.attempt_count += 1;
        batch.updated_at = now;

        Ok(Some(ClaimedBatch {
            id: batch.id,
            tenant_id: batch.tenant_id,
            source_path: batch.source_path.clone(),
            worker_id: worker_id.to_string(),
            attempt: batch.attempt_count,
            claimed_at: now,
        }))
    }

    async fn reap(&self, policy: &ReapPolicy) -> StoreResult<ReapReport> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let mut report = ReapReport::default();

        for batch in inner.batches.values_mut() {
            let stale = batch.status == BatchStatus::Claimed
                && batch
                    .heartbeat_at
                    .is_some_and(|hb| policy.is_stale(hb, now));
            if !stale {
                continue;
            }

            if policy.is_exhausted(batch.attempt_count) {
                let summary =
                    OutcomeSummary::exhausted(batch.attempt_count, batch.claimed_by.clone(), now);
                batch.status = batch.status.transition(BatchStatus::Failed)?;
                batch.last_error_code = Some(BatchErrorCode::MaxAttemptsExhausted.as_str().into());
                batch.outcome_summary = Some(serde_json::to_value(&summary)?);
                report.exhausted += 1;
            } else {
                batch.status = batch.status.transition(BatchStatus::Claimable)?;
                batch.last_error_code = Some(BatchErrorCode::LeaseExpired.as_str().into());
                report.reset += 1;
            }
            batch.last_error_at = Some(now);
            batch.updated_at = now;
            release(batch);
        }

        if !report.is_empty() {
            debug!(reset = report.reset, exhausted = report.exhausted, "Reaped stale claims");
        }
        Ok(report)
    }

    async fn write_chunk(
        &self,
        lease: &ClaimedBatch,
        rows: &[StagedRow],
    ) -> StoreResult<ChunkReceipt> {
        let mut inner = self.inner.lock().await;
        let tenant_id = inner.leased_mut(lease)?.tenant_id;

        let mut inserted: u64 = 0;
        let mut highest: i64 = 0;
        for row in rows {
            highest = highest.max(row.row_index);
            let key = (lease.id, row.row_index);
            if let std::collections::btree_map::Entry::Vacant(slot) = inner.rows.entry(key) {
                slot.insert(PersistedRow::from_staged(lease.id, tenant_id, row));
                inserted += 1;
            }
        }

        let batch = inner.batch_mut(lease.id)?;
        batch.total_rows = batch.total_rows.max(highest);

        Ok(ChunkReceipt {
            inserted,
            total_rows: batch.total_rows,
        })
    }

    async fn heartbeat(&self, lease: &ClaimedBatch) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let batch = inner.leased_mut(lease)?;
        batch.heartbeat_at = Some(now);
        batch.updated_at = now;
        Ok(())
    }

    async fn complete(&self, lease: &ClaimedBatch, summary: &OutcomeSummary) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.finish(lease, BatchStatus::Staged, None, summary)
    }

    async fn fail(
        &self,
        lease: &ClaimedBatch,
        code: BatchErrorCode,
        summary: &OutcomeSummary,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.finish(lease, BatchStatus::Failed, Some(code), summary)
    }

    async fn record_attempt_error(
        &self,
        lease: &ClaimedBatch,
        code: BatchErrorCode,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let batch = inner.leased_mut(lease)?;
        batch.last_error_code = Some(code.as_str().to_string());
        batch.last_error_at = Some(now);
        batch.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl BatchCatalog for MemoryBatchStore {
    async fn create_batch(&self, new: NewBatch) -> StoreResult<Batch> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let batch = Batch {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            source_path: new.source_path,
            status: BatchStatus::Created,
            claimed_by: None,
            claimed_at: None,
            heartbeat_at: None,
            attempt_count: 0,
            last_error_at: None,
            last_error_code: None,
            total_rows: 0,
            outcome_summary: None,
            created_at: now,
            updated_at: now,
        };
        inner.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn mark_claimable(&self, id: Uuid) -> StoreResult<Batch> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let batch = inner.batch_mut(id)?;
        batch.status = batch.status.transition(BatchStatus::Claimable)?;
        batch.updated_at = now;
        Ok(batch.clone())
    }

    async fn get_batch(&self, id: Uuid) -> StoreResult<Option<Batch>> {
        Ok(self.inner.lock().await.batches.get(&id).cloned())
    }

    async fn staged_rows(&self, id: Uuid) -> StoreResult<Vec<PersistedRow>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .range((id, i64::MIN)..=(id, i64::MAX))
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
