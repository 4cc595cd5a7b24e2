//! Filesystem source rooted at a directory

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{SourceReader, SourceStream};
use crate::error::SourceError;

/// Reads sources relative to a root directory.
///
/// Paths must stay inside the root: absolute paths and `..` components are
/// rejected before touching the filesystem.
#[derive(Debug, Clone)]
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SourceError> {
        let relative = Path::new(path);
        let invalid = |reason| SourceError::InvalidPath {
            path: path.to_string(),
            reason,
        };

        if path.is_empty() {
            return Err(invalid("empty path"));
        }

        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(invalid("parent directory components are not allowed"))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("absolute paths are not allowed"))
                }
            }
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl SourceReader for LocalSource {
    async fn open(&self, path: &str) -> Result<SourceStream, SourceError> {
        let full = self.resolve(path)?;
        debug!(path = %full.display(), "Opening local source");

        match tokio::fs::File::open(&full).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SourceError::NotFound {
                path: path.to_string(),
            }),
            Err(source) => Err(SourceError::Io {
                path: path.to_string(),
                source,
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
    async fn test_reads_file_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tenant-a")).unwrap();
        std::fs::write(dir.path().join("tenant-a/contacts.csv"), "id\n1\n").unwrap();

        let source = LocalSource::new(dir.path());
        let mut stream = source.open("tenant-a/contacts.csv").await.unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "id\n1\n");
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let source = LocalSource::new(dir.path());

        for path in ["../secrets.csv", "a/../../b.csv", "/etc/passwd", ""] {
            let err = source.open(path).await.err().unwrap();
            assert!(
                matches!(err, SourceError::InvalidPath { .. }),
                "{path} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let source = LocalSource::new(dir.path());
        let err = source.open("nope.csv").await.err().unwrap();
        assert!(matches!(err, SourceError::NotFound { .. }));
    }
}
