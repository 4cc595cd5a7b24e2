//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::lease::{ReapPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_STALE_AFTER_SECS};
use crate::outcome::DEFAULT_REJECTED_SAMPLE_SIZE;
use crate::source::S3SourceConfig;

// ============================================================================
// Database Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/batchline";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Worker Constants
// ============================================================================

/// Default sleep between idle poll iterations.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default hard ceiling on rows per batch.
pub const DEFAULT_ADMISSION_CAP: i64 = 10_000;

/// Default rows per staging chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Largest accepted staging chunk.
pub const MAX_CHUNK_SIZE: usize = 5_000;

// ============================================================================
// API / Source Constants
// ============================================================================

/// Default status API host binding.
pub const DEFAULT_API_HOST: &str = "127.0.0.1";

/// Default status API port.
pub const DEFAULT_API_PORT: u16 = 8081;

/// Default root directory for the local source backend.
pub const DEFAULT_SOURCE_LOCAL_ROOT: &str = "./data";

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub lease: LeaseConfig,
    pub ingest: IngestConfig,
    pub source: SourceConfig,
    pub api: ApiConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub run_migrations: bool,
}

/// Poll loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identity recorded in `claimed_by`.
    pub worker_id: String,
    pub poll_interval_secs: u64,
}

/// Reaper thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub stale_after_secs: u64,
    pub max_attempts: i32,
}

/// Pipeline limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub admission_cap: i64,
    pub chunk_size: usize,
    pub rejected_sample_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceBackend {
    Local,
    S3,
}

impl FromStr for SourceBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(SourceBackend::Local),
            "s3" => Ok(SourceBackend::S3),
            other => anyhow::bail!("Unknown source backend: {other} (expected local or s3)"),
        }
    }
}

/// Source reader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub backend: SourceBackend,
    pub local_root: PathBuf,
    pub s3: S3SourceConfig,
}

/// Status API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

/// `<hostname>:<pid>`
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let backend = match std::env::var("SOURCE_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => SourceBackend::Local,
        };

        let config = Config {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
                run_migrations: env_or("DATABASE_RUN_MIGRATIONS", true),
            },
            worker: WorkerConfig {
                worker_id: std::env::var("WORKER_ID").unwrap_or_else(|_| default_worker_id()),
                poll_interval_secs: env_or("WORKER_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS),
            },
            lease: LeaseConfig {
                stale_after_secs: env_or("LEASE_STALE_AFTER_SECS", DEFAULT_STALE_AFTER_SECS),
                max_attempts: env_or("LEASE_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
            },
            ingest: IngestConfig {
                admission_cap: env_or("INGEST_ADMISSION_CAP", DEFAULT_ADMISSION_CAP),
                chunk_size: env_or("INGEST_CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
                rejected_sample_size: env_or(
                    "INGEST_REJECTED_SAMPLE_SIZE",
                    DEFAULT_REJECTED_SAMPLE_SIZE,
                ),
            },
            source: SourceConfig {
                backend,
                local_root: std::env::var("SOURCE_LOCAL_ROOT")
                    .unwrap_or_else(|_| DEFAULT_SOURCE_LOCAL_ROOT.to_string())
                    .into(),
                s3: S3SourceConfig::from_env(),
            },
            api: ApiConfig {
                enabled: env_or("API_ENABLED", true),
                host: std::env::var("API_HOST").unwrap_or_else(|_| DEFAULT_API_HOST.to_string()),
                port: env_or("API_PORT", DEFAULT_API_PORT),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.worker.worker_id.trim().is_empty() {
            anyhow::bail!("Worker id cannot be blank");
        }

        if self.worker.poll_interval_secs == 0 {
            anyhow::bail!("Worker poll interval must be greater than 0");
        }

        if self.lease.stale_after_secs == 0 {
            anyhow::bail!("Lease stale threshold must be greater than 0");
        }

        if self.lease.max_attempts < 1 {
            anyhow::bail!("Lease max_attempts must be at least 1");
        }

        if self.ingest.admission_cap < 1 {
            anyhow::bail!("Ingest admission cap must be greater than 0");
        }

        if !(1..=MAX_CHUNK_SIZE).contains(&self.ingest.chunk_size) {
            anyhow::bail!(
                "Ingest chunk size must be between 1 and {} (got {})",
                MAX_CHUNK_SIZE,
                self.ingest.chunk_size
            );
        }

        if self.api.enabled && self.api.port == 0 {
            anyhow::bail!("API port must be greater than 0");
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.worker.poll_interval_secs)
    }

    pub fn reap_policy(&self) -> ReapPolicy {
        ReapPolicy {
            stale_after: Duration::from_secs(self.lease.stale_after_secs),
            max_attempts: self.lease.max_attempts,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            admission_cap: DEFAULT_ADMISSION_CAP,
            chunk_size: DEFAULT_CHUNK_SIZE,
            rejected_sample_size: DEFAULT_REJECTED_SAMPLE_SIZE,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                run_migrations: true,
            },
            worker: WorkerConfig {
                worker_id: default_worker_id(),
                poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            },
            lease: LeaseConfig {
                stale_after_secs: DEFAULT_STALE_AFTER_SECS,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
            },
            ingest: IngestConfig::default(),
            source: SourceConfig {
                backend: SourceBackend::Local,
                local_root: DEFAULT_SOURCE_LOCAL_ROOT.into(),
                s3: S3SourceConfig::default(),
            },
            api: ApiConfig {
                enabled: true,
                host: DEFAULT_API_HOST.to_string(),
                port: DEFAULT_API_PORT,
            },
        }
    }
}
