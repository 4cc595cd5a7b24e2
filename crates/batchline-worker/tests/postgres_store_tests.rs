//! PgBatchStore against a real PostgreSQL
//!
//! These start a container per test and need Docker:
//!
//! ```text
//! cargo test -p batchline-worker --test postgres_store_tests -- --ignored
//! ```

mod common;

use std::sync::Arc;
use std::time::Duration;

use batchline_common::{BatchErrorCode, BatchStatus, RowErrorCode, RowOutcome};
use batchline_worker::batch::{Classification, NewBatch, StagedRow};
use batchline_worker::error::StoreError;
use batchline_worker::lease::ReapPolicy;
use batchline_worker::outcome::{OutcomeReporter, OutcomeSummary};
use batchline_worker::store::{BatchCatalog, BatchStore};
use chrono::Utc;
use common::{enqueue, TestPostgres};
use serde_json::json;
use serial_test::serial;
use uuid::Uuid;

fn admissible(row_index: i64) -> StagedRow {
    StagedRow {
        row_index,
        classification: Classification::Admissible {
            payload: json!({"external_id": format!("c-{row_index}"), "full_name": "Ada"}),
        },
        raw: Some(json!({"id": format!("c-{row_index}"), "tenant_id": "someone-else"})),
    }
}

fn rejected(row_index: i64) -> StagedRow {
    StagedRow {
        row_index,
        classification: Classification::Rejected {
            code: RowErrorCode::InvalidEmail,
            detail: "email: not a valid email address".into(),
        },
        raw: Some(json!({"email": "nope"})),
    }
}

/// Policy under which any claim older than the current statement is stale.
fn immediate(max_attempts: i32) -> ReapPolicy {
    ReapPolicy {
        stale_after: Duration::ZERO,
        max_attempts,
    }
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_claim_sets_lease_and_skips_created() {
    let pg = TestPostgres::start().await.unwrap();
    let store = pg.store();

    let held = store
        .create_batch(NewBatch {
            tenant_id: Uuid::new_v4(),
            source_path: "held.csv".into(),
        })
        .await
        .unwrap();
    assert_eq!(held.status, BatchStatus::Created);
    assert!(store.claim("w-1").await.unwrap().is_none());

    let id = enqueue(&store, Uuid::new_v4(), "a.csv").await;
    let lease = store.claim("w-1").await.unwrap().unwrap();
    assert_eq!(lease.id, id);
    assert_eq!(lease.attempt, 1);

    let batch = store.get_batch(id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Claimed);
    assert_eq!(batch.claimed_by.as_deref(), Some("w-1"));
    assert!(batch.claimed_at.is_some());
    assert!(batch.heartbeat_at.is_some());
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_concurrent_claims_skip_locked_rows() {
    let pg = TestPostgres::start().await.unwrap();
    let store = Arc::new(pg.store());
    enqueue(store.as_ref(), Uuid::new_v4(), "only.csv").await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.claim(&format!("w-{i}")).await.unwrap()
        }));
    }

    let mut claimed = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_write_chunk_is_idempotent_and_tenant_scoped() {
    let pg = TestPostgres::start().await.unwrap();
    let store = pg.store();
    let tenant = Uuid::new_v4();
    let id = enqueue(&store, tenant, "a.csv").await;
    let lease = store.claim("w-1").await.unwrap().unwrap();

    let first = store
        .write_chunk(&lease, &[admissible(1), rejected(2), admissible(3)])
        .await
        .unwrap();
    assert_eq!(first.inserted, 3);
    assert_eq!(first.total_rows, 3);

    let replay = store
        .write_chunk(&lease, &[admissible(2), admissible(3), admissible(4)])
        .await
        .unwrap();
    assert_eq!(replay.inserted, 1);
    assert_eq!(replay.total_rows, 4);

    let rows = store.staged_rows(id).await.unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.tenant_id == tenant));
    assert_eq!(rows[1].outcome, RowOutcome::Rejected);
    assert_eq!(rows[1].error_code.as_deref(), Some("INVALID_EMAIL"));
    assert_eq!(rows[0].raw.as_ref().unwrap()["tenant_id"], "someone-else");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_tenant_cannot_be_changed() {
    let pg = TestPostgres::start().await.unwrap();
    let store = pg.store();
    let id = enqueue(&store, Uuid::new_v4(), "a.csv").await;

    let result = sqlx::query("UPDATE ingest_batches SET tenant_id = $1 WHERE id = $2")
        .bind(Uuid::new_v4())
        .bind(id)
        .execute(pg.pool())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_reap_resets_then_exhausts() {
    let pg = TestPostgres::start().await.unwrap();
    let store = pg.store();
    let id = enqueue(&store, Uuid::new_v4(), "a.csv").await;
    let policy = immediate(2);

    let first = store.claim("w-1").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = store.reap(&policy).await.unwrap();
    assert_eq!(report.reset, 1);

    let err = store.heartbeat(&first).await.unwrap_err();
    assert!(err.is_lease_lost());

    store.claim("w-2").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = store.reap(&policy).await.unwrap();
    assert_eq!(report.exhausted, 1);

    let batch = store.get_batch(id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.attempt_count, 2);
    assert_eq!(batch.last_error_code.as_deref(), Some("MAX_ATTEMPTS_EXHAUSTED"));
    assert!(batch.claimed_by.is_none());

    let summary: OutcomeSummary = serde_json::from_value(batch.outcome_summary.unwrap()).unwrap();
    assert_eq!(summary, OutcomeSummary::exhausted(2, Some("w-2".into()), summary.finished_at));

    assert!(store.reap(&policy).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_terminal_transitions() {
    let pg = TestPostgres::start().await.unwrap();
    let store = pg.store();
    let id = enqueue(&store, Uuid::new_v4(), "a.csv").await;
    let lease = store.claim("w-1").await.unwrap().unwrap();

    store
        .record_attempt_error(&lease, BatchErrorCode::SourceReadFailed)
        .await
        .unwrap();
    let batch = store.get_batch(id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Claimed);
    assert_eq!(batch.last_error_code.as_deref(), Some("SOURCE_READ_FAILED"));

    let mut reporter = OutcomeReporter::default();
    reporter.observe(&admissible(1));
    let summary = OutcomeSummary::staged(&lease, reporter.counts(), Utc::now());
    store.complete(&lease, &summary).await.unwrap();

    let batch = store.get_batch(id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Staged);
    assert!(batch.claimed_by.is_none());
    assert_eq!(batch.outcome_summary.unwrap()["counts"]["total_admitted"], 1);

    let err = store
        .fail(&lease, BatchErrorCode::MalformedSource, &summary)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition(_)));

    let err = store.mark_claimable(id).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition(_)));
}

#[tokio::test]
#[serial]
#[ignore] // Requires Docker
async fn test_unknown_batch() {
    let pg = TestPostgres::start().await.unwrap();
    let store = pg.store();

    store.ping().await.unwrap();
    assert!(store.get_batch(Uuid::new_v4()).await.unwrap().is_none());
    let err = store.mark_claimable(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}
