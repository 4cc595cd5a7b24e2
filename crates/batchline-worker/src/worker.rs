//! Poll loop
//!
//! Each iteration reaps stale claims, claims at most one batch and runs it
//! to a terminal state. Workers never talk to each other; every decision is
//! a conditional write against the store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use batchline_common::{BatchErrorCode, BatchStatus};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::ClaimedBatch;
use crate::config::{Config, IngestConfig};
use crate::error::StoreError;
use crate::lease::{ReapPolicy, ReapReport};
use crate::outcome::OutcomeSummary;
use crate::pipeline::{IngestPipeline, PipelineOutcome};
use crate::source::SourceReader;
use crate::store::BatchStore;

/// What one call to [`IngestWorker::run_once`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Nothing was claimable.
    Idle,
    /// The batch reached a terminal status.
    Processed { batch_id: Uuid, status: BatchStatus },
    /// A transient failure was recorded; the batch stays claimed until reaped.
    Deferred { batch_id: Uuid, code: BatchErrorCode },
    /// The lease was lost mid-run and the batch was left alone.
    Abandoned { batch_id: Uuid },
}

pub struct IngestWorker {
    worker_id: String,
    store: Arc<dyn BatchStore>,
    source: Arc<dyn SourceReader>,
    policy: ReapPolicy,
    ingest: IngestConfig,
    poll_interval: Duration,
}

impl IngestWorker {
    pub fn new(
        worker_id: impl Into<String>,
        store: Arc<dyn BatchStore>,
        source: Arc<dyn SourceReader>,
        policy: ReapPolicy,
        ingest: IngestConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            store,
            source,
            policy,
            ingest,
            poll_interval,
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn BatchStore>,
        source: Arc<dyn SourceReader>,
    ) -> Self {
        Self::new(
            config.worker.worker_id.clone(),
            store,
            source,
            config.reap_policy(),
            config.ingest.clone(),
            config.poll_interval(),
        )
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn reap(&self) -> Result<ReapReport> {
        let report = self
            .store
            .reap(&self.policy)
            .await
            .context("Failed to reap stale claims")?;

        if !report.is_empty() {
            info!(reset = report.reset, exhausted = report.exhausted, "Reaped stale claims");
        }
        Ok(report)
    }

    /// Reap, claim, process. A reap failure is logged and does not stop the claim.
    pub async fn run_once(&self) -> Result<IterationOutcome> {
        if let Err(e) = self.reap().await {
            warn!(error = %format!("{e:#}"), "Reap failed, will retry next iteration");
        }

        let Some(lease) = self
            .store
            .claim(&self.worker_id)
            .await
            .context("Failed to claim batch")?
        else {
            return Ok(IterationOutcome::Idle);
        };

        let span = info_span!(
            "batch",
            batch_id = %lease.id,
            tenant_id = %lease.tenant_id,
            attempt = lease.attempt
        );
        self.process(&lease).instrument(span).await
    }

    /// Run the pipeline for a lease and apply the resulting transition.
    pub async fn process(&self, lease: &ClaimedBatch) -> Result<IterationOutcome> {
        info!(source_path = %lease.source_path, "Processing batch");

        let pipeline = IngestPipeline::new(self.store.as_ref(), self.source.as_ref(), &self.ingest);
        let outcome = match pipeline.run(lease).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_lease_lost() => {
                warn!("Lease lost during pipeline run, dropping batch");
                return Ok(IterationOutcome::Abandoned { batch_id: lease.id });
            }
            Err(e) => {
                let Some(code) = e.attempt_error_code() else {
                    return Err(e).context("Pipeline failed");
                };
                warn!(error = %e, code = %code, "Source unavailable, leaving batch for the reaper");
                return self.defer(lease, code).await;
            }
        };

        let result = match outcome {
            PipelineOutcome::Completed { counts } => {
                info!(
                    parsed = counts.total_parsed,
                    admitted = counts.total_admitted,
                    rejected = counts.total_rejected,
                    "Batch staged"
                );
                let summary = OutcomeSummary::staged(lease, counts, Utc::now());
                self.store
                    .complete(lease, &summary)
                    .await
                    .map(|()| BatchStatus::Staged)
            }
            PipelineOutcome::Failed {
                code,
                message,
                counts,
            } => {
                warn!(code = %code, %message, parsed = counts.total_parsed, "Batch failed");
                let summary = OutcomeSummary::failed(lease, counts, code, message, Utc::now());
                self.store
                    .fail(lease, code, &summary)
                    .await
                    .map(|()| BatchStatus::Failed)
            }
        };

        match result {
            Ok(status) => Ok(IterationOutcome::Processed {
                batch_id: lease.id,
                status,
            }),
            Err(StoreError::LeaseLost { batch_id }) => {
                warn!("Lease lost before the final transition, dropping batch");
                Ok(IterationOutcome::Abandoned { batch_id })
            }
            Err(e) => Err(e).context("Failed to record batch outcome"),
        }
    }

    async fn defer(&self, lease: &ClaimedBatch, code: BatchErrorCode) -> Result<IterationOutcome> {
        match self.store.record_attempt_error(lease, code).await {
            Ok(()) => Ok(IterationOutcome::Deferred {
                batch_id: lease.id,
                code,
            }),
            Err(e) if e.is_lease_lost() => Ok(IterationOutcome::Abandoned { batch_id: lease.id }),
            Err(e) => Err(e).context("Failed to record attempt error"),
        }
    }

    /// Loop until `shutdown` fires. Sleeps only when an iteration found no work.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.worker_id, "Worker started");

        while !shutdown.is_cancelled() {
            let span = info_span!("iteration", worker_id = %self.worker_id);
            let idle = match self.run_once().instrument(span).await {
                Ok(IterationOutcome::Idle) => true,
                Ok(outcome) => {
                    debug!(?outcome, "Iteration finished");
                    false
                }
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Iteration failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!(worker_id = %self.worker_id, "Worker stopped");
    }
}
