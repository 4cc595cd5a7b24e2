//! Batchline Worker - Main entry point
#![deny(clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use batchline_common::logging::{init_logging, LogConfig};
use batchline_worker::{
    api,
    api::BatchView,
    batch::NewBatch,
    config::Config,
    db,
    pipeline::preview_stream,
    source::{self, LocalSource, SourceStream},
    store::{BatchCatalog, BatchStore, MemoryBatchStore, PgBatchStore},
    worker::{IngestWorker, IterationOutcome},
};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "batchline-worker")]
#[command(author, version, about = "Batch ingestion worker", long_about = None)]
struct Cli {
    /// Subcommand to execute (defaults to `run`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reap, claim, process loop until interrupted
    Run,

    /// Run one reaper pass and exit
    Reap,

    /// Register a source file as a new batch
    Enqueue {
        /// Tenant that owns the batch
        #[arg(long)]
        tenant: Uuid,

        /// Source path, relative to the configured backend
        #[arg(long)]
        source: String,

        /// Leave the batch in `created` instead of releasing it to workers
        #[arg(long)]
        hold: bool,
    },

    /// Print a batch's coordination state
    Status {
        batch_id: Uuid,
    },

    /// Show how a file's headers are normalized and mapped
    Preview {
        file: PathBuf,
    },

    /// Run the full pipeline on a local file without touching the database
    DryRun {
        file: PathBuf,

        /// Tenant recorded on the in-memory batch
        #[arg(long)]
        tenant: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let log_config = LogConfig::builder()
        .log_file_prefix("batchline-worker")
        .filter_directives("batchline_worker=debug,tower_http=info,sqlx=warn")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run().await,
        Commands::Reap => reap().await,
        Commands::Enqueue {
            tenant,
            source,
            hold,
        } => enqueue(tenant, source, hold).await,
        Commands::Status { batch_id } => status(batch_id).await,
        Commands::Preview { file } => preview(&file).await,
        Commands::DryRun { file, tenant } => dry_run(&file, tenant).await,
    }
}

async fn connect_store(config: &Config) -> Result<Arc<PgBatchStore>> {
    let pool = db::connect(&config.database)
        .await
        .context("Failed to connect to the database")?;
    Ok(Arc::new(PgBatchStore::new(pool)))
}

async fn run() -> Result<()> {
    let config = Config::load()?;
    info!(worker_id = %config.worker.worker_id, "Starting batchline worker");

    let store = connect_store(&config).await?;
    let source = source::from_config(&config.source)
        .await
        .context("Failed to initialize source reader")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let api_handle = if config.api.enabled {
        let api_config = config.api.clone();
        let catalog: Arc<dyn BatchCatalog> = store.clone();
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(&api_config, catalog, token.clone()).await {
                error!(error = %format!("{e:#}"), "Status API failed");
                token.cancel();
            }
        }))
    } else {
        info!("Status API is disabled (API_ENABLED=false)");
        None
    };

    let worker = IngestWorker::from_config(&config, store, source);
    worker.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Some(handle) = api_handle {
        if let Err(e) = handle.await {
            warn!("Status API task ended abnormally: {}", e);
        }
    }

    info!("Worker shut down gracefully");
    Ok(())
}

async fn reap() -> Result<()> {
    let config = Config::load()?;
    let store = connect_store(&config).await?;

    let report = store.reap(&config.reap_policy()).await?;
    println!("reset: {}, exhausted: {}", report.reset, report.exhausted);
    Ok(())
}

async fn enqueue(tenant: Uuid, source: String, hold: bool) -> Result<()> {
    let config = Config::load()?;
    let store = connect_store(&config).await?;

    let mut batch = store
        .create_batch(NewBatch {
            tenant_id: tenant,
            source_path: source,
        })
        .await?;
    if !hold {
        batch = store.mark_claimable(batch.id).await?;
    }

    info!(batch_id = %batch.id, status = %batch.status, "Batch enqueued");
    println!("{}", batch.id);
    Ok(())
}

async fn status(batch_id: Uuid) -> Result<()> {
    let config = Config::load()?;
    let store = connect_store(&config).await?;

    let batch = store
        .get_batch(batch_id)
        .await?
        .with_context(|| format!("batch {batch_id} not found"))?;

    println!("{}", serde_json::to_string_pretty(&BatchView::from(batch))?);
    Ok(())
}

async fn preview(file: &Path) -> Result<()> {
    let handle = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let stream: SourceStream = Box::new(handle);

    let preview = preview_stream(stream).await?;
    println!("{}", serde_json::to_string_pretty(&preview)?);
    Ok(())
}

async fn dry_run(file: &Path, tenant: Option<Uuid>) -> Result<()> {
    let config = Config::load()?;

    let root = file.parent().unwrap_or_else(|| Path::new("."));
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} is not a file path", file.display()))?;

    let store = Arc::new(MemoryBatchStore::new());
    let batch = store
        .create_batch(NewBatch {
            tenant_id: tenant.unwrap_or_else(Uuid::new_v4),
            source_path: name.to_string(),
        })
        .await?;
    store.mark_claimable(batch.id).await?;

    let worker = IngestWorker::new(
        "dry-run",
        store.clone(),
        Arc::new(LocalSource::new(root)),
        config.reap_policy(),
        config.ingest.clone(),
        config.poll_interval(),
    );

    match worker.run_once().await? {
        IterationOutcome::Processed { .. } => {}
        other => anyhow::bail!("dry run did not finish: {other:?}"),
    }

    let batch = store
        .get_batch(batch.id)
        .await?
        .context("dry-run batch disappeared")?;
    println!("{}", serde_json::to_string_pretty(&batch.outcome_summary)?);
    Ok(())
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing the current batch");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing the current batch");
        },
    }

    shutdown.cancel();
}
