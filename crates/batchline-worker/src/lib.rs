//! Batchline Worker Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Coordination core for batch ingestion: workers claim uploaded sources,
//! stream them through validation into a staging table, and record a
//! terminal outcome. Postgres is the only coordination point.
//!
//! # Overview
//!
//! - **Store**: claim, reap, chunked staging writes, heartbeat and terminal
//!   transitions behind [`store::BatchStore`], with Postgres and in-memory
//!   implementations
//! - **Pipeline**: header normalization, schema mapping and row
//!   classification over a streaming CSV reader
//! - **Worker**: the reap → claim → process loop
//! - **API**: a read-only status endpoint per batch
//!
//! # Lifecycle
//!
//! ```text
//! created ──► claimable ──► claimed ──► staged
//!                 ▲            │
//!                 └── reaper ──┤
//!                              └──────► failed
//! ```
//!
//! A claimed batch whose heartbeat goes stale is reset to `claimable` by the
//! reaper, or failed once it has used all of its attempts. Staged rows are
//! keyed by `(batch_id, row_index)` and replayed inserts are ignored, so a
//! resumed attempt converges on the same rows.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use batchline_worker::{config::Config, db, source, store::PgBatchStore, worker::IngestWorker};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = db::connect(&config.database).await?;
//!     let store = Arc::new(PgBatchStore::new(pool));
//!     let source = source::from_config(&config.source).await?;
//!     IngestWorker::from_config(&config, store, source)
//!         .run(CancellationToken::new())
//!         .await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod batch;
pub mod config;
pub mod db;
pub mod error;
pub mod lease;
pub mod middleware;
pub mod outcome;
pub mod pipeline;
pub mod source;
pub mod staging;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use batch::{Batch, ClaimedBatch, NewBatch, StagedRow};
pub use error::{PipelineError, SourceError, StoreError, StoreResult};
pub use store::{BatchCatalog, BatchStore, MemoryBatchStore, PgBatchStore};
pub use worker::{IngestWorker, IterationOutcome};
