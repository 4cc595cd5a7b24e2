//! Unit-of-work store
//!
//! All coordination between workers goes through conditional updates on the
//! batch rows. Callers only see the operations below; there is no generic
//! read-modify-write, so the claim and reap invariants live entirely inside
//! each implementation.
//!
//! - [`BatchStore`] is the worker path: claim, reap, chunk writes, heartbeat
//!   and the terminal transitions.
//! - [`BatchCatalog`] is the admin and viewer path: registering batches,
//!   releasing them to the queue, and reading them back.

use async_trait::async_trait;
use batchline_common::{BatchErrorCode, BatchStatus};
use uuid::Uuid;

use crate::batch::{Batch, ClaimedBatch, NewBatch, PersistedRow, StagedRow};
use crate::error::{StoreError, StoreResult};
use crate::lease::{ReapPolicy, ReapReport};
use crate::outcome::OutcomeSummary;

pub mod memory;
pub mod postgres;

pub use memory::MemoryBatchStore;
pub use postgres::PgBatchStore;

/// Result of one `write_chunk` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReceipt {
    /// Rows actually inserted; replays of existing row indices are not counted.
    pub inserted: u64,
    /// `total_rows` on the batch after the write.
    pub total_rows: i64,
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Take the oldest claimable batch, skipping rows another claimant holds.
    async fn claim(&self, worker_id: &str) -> StoreResult<Option<ClaimedBatch>>;

    /// Reset or fail every claimed batch whose heartbeat is stale.
    async fn reap(&self, policy: &ReapPolicy) -> StoreResult<ReapReport>;

    /// Insert a chunk of rows, ignoring row indices that already exist.
    async fn write_chunk(&self, lease: &ClaimedBatch, rows: &[StagedRow])
        -> StoreResult<ChunkReceipt>;

    async fn heartbeat(&self, lease: &ClaimedBatch) -> StoreResult<()>;

    /// `claimed -> staged`.
    async fn complete(&self, lease: &ClaimedBatch, summary: &OutcomeSummary) -> StoreResult<()>;

    /// `claimed -> failed`.
    async fn fail(
        &self,
        lease: &ClaimedBatch,
        code: BatchErrorCode,
        summary: &OutcomeSummary,
    ) -> StoreResult<()>;

    /// Note a non-terminal failure on a batch that stays claimed.
    async fn record_attempt_error(&self, lease: &ClaimedBatch, code: BatchErrorCode)
        -> StoreResult<()>;
}

#[async_trait]
pub trait BatchCatalog: Send + Sync {
    async fn create_batch(&self, new: NewBatch) -> StoreResult<Batch>;

    /// `created -> claimable`.
    async fn mark_claimable(&self, id: Uuid) -> StoreResult<Batch>;

    async fn get_batch(&self, id: Uuid) -> StoreResult<Option<Batch>>;

    /// Staged rows of a batch in row order.
    async fn staged_rows(&self, id: Uuid) -> StoreResult<Vec<PersistedRow>>;

    async fn ping(&self) -> StoreResult<()>;
}

/// Error for a guarded write that matched nothing, given the batch's current status.
///
/// A batch that is still in flight (claimed by someone else, or reset by the
/// reaper) means the lease was lost. Anything else is an illegal transition.
pub(crate) fn unmatched_write(id: Uuid, current: BatchStatus, target: BatchStatus) -> StoreError {
    match current {
        BatchStatus::Claimed | BatchStatus::Claimable => StoreError::LeaseLost { batch_id: id },
        other => match other.transition(target) {
            Err(e) => StoreError::InvalidTransition(e),
            Ok(_) => StoreError::LeaseLost { batch_id: id },
        },
    }
}
