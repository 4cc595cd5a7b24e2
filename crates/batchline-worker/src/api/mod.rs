//! Read-only status API
//!
//! - `GET /health` pings the store
//! - `GET /api/v1/batches/:batch_id` returns a batch's coordination state

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use batchline_common::BatchStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::batch::Batch;
use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::middleware;
use crate::store::BatchCatalog;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn BatchCatalog>,
}

/// Public view of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchView {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub status: BatchStatus,
    pub attempt_count: i32,
    pub claimed_by: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub total_rows: i64,
    pub outcome_summary: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Batch> for BatchView {
    fn from(batch: Batch) -> Self {
        Self {
            id: batch.id,
            tenant_id: batch.tenant_id,
            status: batch.status,
            attempt_count: batch.attempt_count,
            claimed_by: batch.claimed_by,
            heartbeat_at: batch.heartbeat_at,
            last_error_code: batch.last_error_code,
            last_error_at: batch.last_error_at,
            total_rows: batch.total_rows,
            outcome_summary: batch.outcome_summary,
            created_at: batch.created_at,
            updated_at: batch.updated_at,
        }
    }
}

pub fn router(catalog: Arc<dyn BatchCatalog>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/batches/:batch_id", get(get_batch))
        .with_state(AppState { catalog })
        .layer(middleware::tracing_layer())
}

/// Serve the API until `shutdown` fires.
pub async fn serve(
    config: &ApiConfig,
    catalog: Arc<dyn BatchCatalog>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status API listening on {}", addr);

    axum::serve(listener, router(catalog))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Status API shut down");
    Ok(())
}

async fn health(State(state): State<AppState>) -> Response {
    match state.catalog.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected"
            })),
        )
            .into_response(),
        Err(e) => {
            error!("Database health check failed: {:?}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "database": "unreachable"
                })),
            )
                .into_response()
        }
    }
}

async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<BatchView>, ApiError> {
    let batch = state
        .catalog
        .get_batch(batch_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("batch {batch_id} not found")))?;

    Ok(Json(batch.into()))
}
