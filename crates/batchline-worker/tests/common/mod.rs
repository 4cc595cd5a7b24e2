//! Shared helpers for batchline-worker integration tests
//!
//! - In-memory helpers for coordination and pipeline tests
//! - [`TestPostgres`], a PostgreSQL container with migrations applied, for
//!   the store tests that need a real database (Docker required)
#![allow(dead_code)]

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use batchline_worker::batch::NewBatch;
use batchline_worker::error::SourceError;
use batchline_worker::source::{SourceReader, SourceStream};
use batchline_worker::store::{BatchCatalog, PgBatchStore};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::info;
use uuid::Uuid;

/// Register a batch and release it to workers.
pub async fn enqueue(catalog: &dyn BatchCatalog, tenant_id: Uuid, source_path: &str) -> Uuid {
    let batch = catalog
        .create_batch(NewBatch {
            tenant_id,
            source_path: source_path.to_string(),
        })
        .await
        .expect("create batch");
    catalog
        .mark_claimable(batch.id)
        .await
        .expect("mark claimable");
    batch.id
}

/// A CSV with `rows` valid contact rows.
pub fn contacts_csv(rows: usize) -> String {
    let mut body = String::from("external_id,full_name,email\n");
    for i in 1..=rows {
        body.push_str(&format!("c-{i},Contact {i},contact{i}@example.com\n"));
    }
    body
}

/// Byte offset just past the end of data row `row` in `body`.
pub fn end_of_row(body: &str, row: usize) -> usize {
    body.match_indices('\n')
        .nth(row)
        .map(|(i, _)| i + 1)
        .expect("row exists")
}

/// Serves one body that breaks with a transport error after `fail_after` bytes.
pub struct FlakySource {
    body: Vec<u8>,
    fail_after: usize,
}

impl FlakySource {
    pub fn new(body: impl Into<Vec<u8>>, fail_after: usize) -> Self {
        Self {
            body: body.into(),
            fail_after,
        }
    }
}

#[async_trait]
impl SourceReader for FlakySource {
    async fn open(&self, _path: &str) -> Result<SourceStream, SourceError> {
        Ok(Box::new(FlakyReader {
            body: self.body.clone(),
            position: 0,
            fail_after: self.fail_after,
        }))
    }
}

struct FlakyReader {
    body: Vec<u8>,
    position: usize,
    fail_after: usize,
}

impl AsyncRead for FlakyReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        if this.position >= this.fail_after {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }

        let end = this.fail_after.min(this.body.len());
        let available = &this.body[this.position..end];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.position += n;
        Poll::Ready(Ok(()))
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL test container with migrations applied.
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("postgresql://postgres:postgres@{host}:{port}/postgres"))
            .await
            .context("Failed to connect to PostgreSQL")?;

        batchline_worker::db::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn store(&self) -> PgBatchStore {
        PgBatchStore::new(self.pool.clone())
    }
}
