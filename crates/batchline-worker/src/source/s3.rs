//! S3-compatible object store source

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    operation::get_object::GetObjectError,
    Client,
};
use serde::{Deserialize, Serialize};
use std::env;
use tracing::{debug, info, instrument};

use super::{SourceReader, SourceStream};
use crate::error::SourceError;

/// Default bucket holding uploaded source files.
pub const DEFAULT_S3_BUCKET: &str = "batchline-uploads";

/// Default region when none is configured.
pub const DEFAULT_S3_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3SourceConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl S3SourceConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var("S3_ENDPOINT").ok(),
            region: env::var("S3_REGION").unwrap_or_else(|_| DEFAULT_S3_REGION.to_string()),
            bucket: env::var("S3_BUCKET").unwrap_or_else(|_| DEFAULT_S3_BUCKET.to_string()),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_else(|_| "minioadmin".to_string()),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        }
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: DEFAULT_S3_REGION.to_string(),
            bucket: bucket.into(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
        }
    }
}

impl Default for S3SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_S3_REGION.to_string(),
            bucket: DEFAULT_S3_BUCKET.to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: false,
        }
    }
}

/// Streams objects from a single bucket.
#[derive(Clone)]
pub struct S3Source {
    client: Client,
    bucket: String,
}

impl S3Source {
    pub async fn new(config: S3SourceConfig) -> Result<Self, SourceError> {
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "Initializing S3 source");

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "batchline-source",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("S3 source initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl SourceReader for S3Source {
    #[instrument(skip(self))]
    async fn open(&self, path: &str) -> Result<SourceStream, SourceError> {
        debug!("Getting stream from s3://{}/{}", self.bucket, path);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| {
                if matches!(e.as_service_error(), Some(GetObjectError::NoSuchKey(_))) {
                    SourceError::NotFound {
                        path: path.to_string(),
                    }
                } else {
                    SourceError::ObjectStore {
                        path: path.to_string(),
                        message: DisplayErrorContext(&e).to_string(),
                    }
                }
            })?;

        Ok(Box::new(Box::pin(response.body.into_async_read())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_minio() {
        let config = S3SourceConfig::for_minio("http://localhost:9000", "uploads");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.bucket, "uploads");
        assert!(config.path_style);
    }

    #[test]
    fn test_default_targets_aws_region() {
        let config = S3SourceConfig::default();
        assert!(config.endpoint.is_none());
        assert_eq!(config.region, DEFAULT_S3_REGION);
        assert_eq!(config.bucket, DEFAULT_S3_BUCKET);
    }

    #[tokio::test]
    async fn test_client_builds_without_network() {
        let source = S3Source::new(S3SourceConfig::for_minio("http://127.0.0.1:9", "b"))
            .await
            .is_ok();
        assert!(source);
    }
}
