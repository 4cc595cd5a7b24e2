//! Source readers
//!
//! A source turns the `source_path` stored on a batch into a byte stream.
//! Storage of the uploaded file is owned elsewhere; this module only reads.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::config::{SourceBackend, SourceConfig};
use crate::error::SourceError;

pub mod local;
pub mod s3;

pub use local::LocalSource;
pub use s3::{S3Source, S3SourceConfig};

/// Byte stream over one source object.
pub type SourceStream = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn open(&self, path: &str) -> Result<SourceStream, SourceError>;
}

/// Build the reader selected by configuration.
pub async fn from_config(config: &SourceConfig) -> Result<Arc<dyn SourceReader>, SourceError> {
    match config.backend {
        SourceBackend::Local => Ok(Arc::new(LocalSource::new(&config.local_root))),
        SourceBackend::S3 => Ok(Arc::new(S3Source::new(config.s3.clone()).await?)),
    }
}

/// Sources held in memory, keyed by path.
#[derive(Debug, Default, Clone)]
pub struct StaticSource {
    objects: HashMap<String, Vec<u8>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.insert(path, body);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.objects.insert(path.into(), body.into());
    }
}

#[async_trait]
impl SourceReader for StaticSource {
    async fn open(&self, path: &str) -> Result<SourceStream, SourceError> {
        match self.objects.get(path) {
            Some(body) => Ok(Box::new(std::io::Cursor::new(body.clone()))),
            None => Err(SourceError::NotFound {
                path: path.to_string(),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_static_source_reads_back() {
        let source = StaticSource::new().with("a.csv", "id,name\n1,Ada\n");
        let mut stream = source.open("a.csv").await.unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "id,name\n1,Ada\n");
    }

    #[tokio::test]
    async fn test_static_source_missing_path() {
        let source = StaticSource::new();
        let err = source.open("missing.csv").await.err().unwrap();
        assert!(matches!(err, SourceError::NotFound { .. }));
    }
}
