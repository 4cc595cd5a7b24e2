//! Chunked staging writer
//!
//! Rows are buffered until a chunk is full, written in one `write_chunk`
//! call, then the lease heartbeat is refreshed. Liveness is therefore
//! tracked per chunk rather than per batch.

use tracing::debug;

use crate::batch::{ClaimedBatch, StagedRow};
use crate::error::StoreResult;
use crate::store::BatchStore;

pub struct StagingWriter<'a> {
    store: &'a dyn BatchStore,
    lease: &'a ClaimedBatch,
    chunk_size: usize,
    buffer: Vec<StagedRow>,
    chunks_written: u64,
    rows_inserted: u64,
}

impl<'a> StagingWriter<'a> {
    pub fn new(store: &'a dyn BatchStore, lease: &'a ClaimedBatch, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            store,
            lease,
            chunk_size,
            buffer: Vec::with_capacity(chunk_size),
            chunks_written: 0,
            rows_inserted: 0,
        }
    }

    /// Buffer a row, writing the chunk once it is full.
    pub async fn push(&mut self, row: StagedRow) -> StoreResult<()> {
        self.buffer.push(row);
        if self.buffer.len() >= self.chunk_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write whatever is buffered. A no-op on an empty buffer.
    pub async fn flush(&mut self) -> StoreResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let receipt = self.store.write_chunk(self.lease, &self.buffer).await?;
        self.store.heartbeat(self.lease).await?;

        self.chunks_written += 1;
        self.rows_inserted += receipt.inserted;
        debug!(
            batch_id = %self.lease.id,
            rows = self.buffer.len(),
            inserted = receipt.inserted,
            total_rows = receipt.total_rows,
            "Chunk staged"
        );
        self.buffer.clear();
        Ok(())
    }

    pub fn chunks_written(&self) -> u64 {
        self.chunks_written
    }

    /// Rows newly inserted by this writer; replayed rows are not counted.
    pub fn rows_inserted(&self) -> u64 {
        self.rows_inserted
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::batch::{Classification, NewBatch};
    use crate::store::{BatchCatalog, MemoryBatchStore};
    use serde_json::json;
    use uuid::Uuid;

    fn row(row_index: i64) -> StagedRow {
        StagedRow {
            row_index,
            classification: Classification::Admissible {
                payload: json!({"external_id": row_index.to_string()}),
            },
            raw: Some(json!({})),
        }
    }

    async fn leased(store: &MemoryBatchStore) -> ClaimedBatch {
        let batch = store
            .create_batch(NewBatch {
                tenant_id: Uuid::new_v4(),
                source_path: "contacts.csv".into(),
            })
            .await
            .unwrap();
        store.mark_claimable(batch.id).await.unwrap();
        store.claim("w-1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_writes_full_chunks_and_remainder() {
        let store = MemoryBatchStore::new();
        let lease = leased(&store).await;

        let mut writer = StagingWriter::new(&store, &lease, 2);
        for i in 1..=5 {
            writer.push(row(i)).await.unwrap();
        }
        assert_eq!(writer.chunks_written(), 2);

        writer.flush().await.unwrap();
        assert_eq!(writer.chunks_written(), 3);
        assert_eq!(writer.rows_inserted(), 5);

        let batch = store.get_batch(lease.id).await.unwrap().unwrap();
        assert_eq!(batch.total_rows, 5);
    }

    #[tokio::test]
    async fn test_flush_refreshes_heartbeat() {
        let store = MemoryBatchStore::new();
        let lease = leased(&store).await;
        let before = store.get_batch(lease.id).await.unwrap().unwrap().heartbeat_at;

        store.advance(chrono::Duration::seconds(30)).await;
        let mut writer = StagingWriter::new(&store, &lease, 10);
        writer.push(row(1)).await.unwrap();
        writer.flush().await.unwrap();

        let after = store.get_batch(lease.id).await.unwrap().unwrap().heartbeat_at;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_empty_flush_writes_nothing() {
        let store = MemoryBatchStore::new();
        let lease = leased(&store).await;

        let mut writer = StagingWriter::new(&store, &lease, 10);
        writer.flush().await.unwrap();
        assert_eq!(writer.chunks_written(), 0);
    }
}
