//! Streaming ingestion pipeline
//!
//! One run reads the batch's source from the first byte, classifies each
//! record and hands it to the [`StagingWriter`]. Rows are never held in
//! memory beyond one chunk.
//!
//! Row indices are positions in the source, so a resumed attempt writes the
//! same indices again and the store ignores the ones already staged. The
//! admission cap is checked against the same indices and therefore counts
//! per batch, not per attempt.

use batchline_common::BatchErrorCode;
use csv_async::{AsyncReaderBuilder, ErrorKind};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::batch::ClaimedBatch;
use crate::config::IngestConfig;
use crate::error::PipelineError;
use crate::outcome::{OutcomeCounts, OutcomeReporter};
use crate::source::{SourceReader, SourceStream};
use crate::staging::StagingWriter;
use crate::store::BatchStore;

pub mod normalize;
pub mod schema;
pub mod validate;

pub use normalize::normalize_headers;
pub use schema::{Field, FieldMapping};
pub use validate::RowClassifier;

/// How a pipeline run ended. Both variants lead to a terminal transition.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed {
        counts: OutcomeCounts,
    },
    Failed {
        code: BatchErrorCode,
        message: String,
        counts: OutcomeCounts,
    },
}

impl PipelineOutcome {
    pub fn counts(&self) -> &OutcomeCounts {
        match self {
            PipelineOutcome::Completed { counts } | PipelineOutcome::Failed { counts, .. } => counts,
        }
    }
}

pub struct IngestPipeline<'a> {
    store: &'a dyn BatchStore,
    source: &'a dyn SourceReader,
    config: &'a IngestConfig,
}

impl<'a> IngestPipeline<'a> {
    pub fn new(
        store: &'a dyn BatchStore,
        source: &'a dyn SourceReader,
        config: &'a IngestConfig,
    ) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    /// Stream the leased batch's source into the staging table.
    ///
    /// Returns `Err` only when the run must stop without a terminal
    /// transition: a lost lease, a store failure, or a transport failure
    /// on the source. Already written chunks are kept in every case.
    pub async fn run(&self, lease: &ClaimedBatch) -> Result<PipelineOutcome, PipelineError> {
        let stream = self.source.open(&lease.source_path).await?;
        let mut reader = AsyncReaderBuilder::new()
            .flexible(true)
            .has_headers(true)
            .create_reader(stream);

        let mut reporter = OutcomeReporter::new(self.config.rejected_sample_size);

        let header_row = match reader.byte_headers().await {
            Ok(headers) => headers.clone(),
            Err(err) => {
                let message = err.to_string();
                return match err.into_kind() {
                    ErrorKind::Io(source) => Err(PipelineError::Read {
                        row_index: 0,
                        source,
                    }),
                    _ => Ok(PipelineOutcome::Failed {
                        code: BatchErrorCode::MalformedSource,
                        message: format!("header row: {message}"),
                        counts: reporter.counts(),
                    }),
                };
            }
        };

        if header_row.is_empty() {
            info!(batch_id = %lease.id, "Source has no header row");
            return Ok(PipelineOutcome::Failed {
                code: BatchErrorCode::EmptySource,
                message: "source has no header row".to_string(),
                counts: reporter.counts(),
            });
        }

        let raw_headers: Vec<String> = header_row
            .iter()
            .map(|h| String::from_utf8_lossy(h).into_owned())
            .collect();
        let classifier = RowClassifier::new(normalize_headers(&raw_headers));

        let missing = classifier.mapping().missing_required();
        if !missing.is_empty() {
            // Every row will be rejected; still staged so the rejections are visible.
            warn!(batch_id = %lease.id, ?missing, "Source lacks required columns");
        }

        let mut writer = StagingWriter::new(self.store, lease, self.config.chunk_size);
        let records = reader.into_byte_records();
        futures::pin_mut!(records);
        let mut row_index: i64 = 0;

        while let Some(next) = records.next().await {
            let record = match next {
                Ok(record) => record,
                Err(err) => {
                    writer.flush().await?;
                    let message = err.to_string();
                    return match err.into_kind() {
                        ErrorKind::Io(source) => Err(PipelineError::Read { row_index, source }),
                        _ => Ok(PipelineOutcome::Failed {
                            code: BatchErrorCode::MalformedSource,
                            message: format!("row {}: {message}", row_index + 1),
                            counts: reporter.counts(),
                        }),
                    };
                }
            };

            row_index += 1;
            if row_index > self.config.admission_cap {
                writer.flush().await?;
                info!(
                    batch_id = %lease.id,
                    cap = self.config.admission_cap,
                    "Admission cap exceeded"
                );
                return Ok(PipelineOutcome::Failed {
                    code: BatchErrorCode::RowLimitExceeded,
                    message: format!(
                        "source has more than {} rows; split it and upload again",
                        self.config.admission_cap
                    ),
                    counts: reporter.counts(),
                });
            }

            let cells: Vec<&[u8]> = record.iter().collect();
            let row = classifier.classify(row_index, &cells);
            reporter.observe(&row);
            writer.push(row).await?;
        }

        writer.flush().await?;
        debug!(
            batch_id = %lease.id,
            rows = row_index,
            chunks = writer.chunks_written(),
            inserted = writer.rows_inserted(),
            "Source exhausted"
        );

        Ok(PipelineOutcome::Completed {
            counts: reporter.counts(),
        })
    }
}

/// One source column as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnPreview {
    pub position: usize,
    pub original: String,
    pub normalized: String,
    pub field: Option<Field>,
}

/// Header normalization and mapping for a source, without staging anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderPreview {
    pub columns: Vec<ColumnPreview>,
    pub missing_required: Vec<Field>,
}

pub fn preview_headers<S: AsRef<str>>(raw: &[S]) -> HeaderPreview {
    let normalized = normalize_headers(raw);
    let mapping = FieldMapping::resolve(&normalized);

    let columns = raw
        .iter()
        .zip(normalized)
        .enumerate()
        .map(|(i, (original, normalized))| ColumnPreview {
            position: i + 1,
            original: original.as_ref().to_string(),
            normalized,
            field: mapping.field_at(i),
        })
        .collect();

    HeaderPreview {
        columns,
        missing_required: mapping.missing_required(),
    }
}

/// Read only the header row of a stream and preview it.
pub async fn preview_stream(stream: SourceStream) -> Result<HeaderPreview, PipelineError> {
    let mut reader = AsyncReaderBuilder::new().flexible(true).create_reader(stream);
    let headers = match reader.byte_headers().await {
        Ok(headers) => headers,
        Err(err) => {
            let message = err.to_string();
            let source = match err.into_kind() {
                ErrorKind::Io(source) => source,
                _ => std::io::Error::new(std::io::ErrorKind::InvalidData, message),
            };
            return Err(PipelineError::Read {
                row_index: 0,
                source,
            });
        }
    };

    let raw: Vec<String> = headers
        .iter()
        .map(|h| String::from_utf8_lossy(h).into_owned())
        .collect();
    Ok(preview_headers(&raw))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::batch::NewBatch;
    use crate::source::StaticSource;
    use crate::store::{BatchCatalog, MemoryBatchStore};
    use batchline_common::RowOutcome;
    use uuid::Uuid;

    fn config(cap: i64, chunk_size: usize) -> IngestConfig {
        IngestConfig {
            admission_cap: cap,
            chunk_size,
            ..IngestConfig::default()
        }
    }

    async fn leased(store: &MemoryBatchStore, path: &str) -> ClaimedBatch {
        let batch = store
            .create_batch(NewBatch {
                tenant_id: Uuid::new_v4(),
                source_path: path.into(),
            })
            .await
            .unwrap();
        store.mark_claimable(batch.id).await.unwrap();
        store.claim("w-1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_stages_every_row() {
        let store = MemoryBatchStore::new();
        let source = StaticSource::new().with(
            "a.csv",
            "id,name,email\nc-1,Ada,ada@example.com\nc-2,,bad\nc-3,Grace,\n",
        );
        let lease = leased(&store, "a.csv").await;
        let cfg = config(100, 2);

        let outcome = IngestPipeline::new(&store, &source, &cfg).run(&lease).await.unwrap();

        let counts = outcome.counts();
        assert!(matches!(outcome, PipelineOutcome::Completed { .. }));
        assert_eq!(counts.total_parsed, 3);
        assert_eq!(counts.total_admitted, 2);
        assert_eq!(counts.total_rejected, 1);

        let rows = store.staged_rows(lease.id).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].outcome, RowOutcome::Rejected);
        assert_eq!(rows[1].error_code.as_deref(), Some("MISSING_REQUIRED_FIELD"));
    }

    #[tokio::test]
    async fn test_empty_source_fails() {
        let store = MemoryBatchStore::new();
        let source = StaticSource::new().with("empty.csv", "");
        let lease = leased(&store, "empty.csv").await;
        let cfg = IngestConfig::default();

        let outcome = IngestPipeline::new(&store, &source, &cfg).run(&lease).await.unwrap();
        match outcome {
            PipelineOutcome::Failed { code, counts, .. } => {
                assert_eq!(code, BatchErrorCode::EmptySource);
                assert_eq!(counts.total_parsed, 0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_header_only_source_completes_empty() {
        let store = MemoryBatchStore::new();
        let source = StaticSource::new().with("h.csv", "id,name\n");
        let lease = leased(&store, "h.csv").await;
        let cfg = IngestConfig::default();

        let outcome = IngestPipeline::new(&store, &source, &cfg).run(&lease).await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::Completed { .. }));
        assert!(store.staged_rows(lease.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cap_keeps_prefix_only() {
        let store = MemoryBatchStore::new();
        let mut body = String::from("id,name\n");
        for i in 1..=6 {
            body.push_str(&format!("c-{i},Name {i}\n"));
        }
        let source = StaticSource::new().with("big.csv", body);
        let lease = leased(&store, "big.csv").await;
        let cfg = config(5, 2);

        let outcome = IngestPipeline::new(&store, &source, &cfg).run(&lease).await.unwrap();
        match outcome {
            PipelineOutcome::Failed { code, counts, .. } => {
                assert_eq!(code, BatchErrorCode::RowLimitExceeded);
                assert_eq!(counts.total_parsed, 5);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let rows = store.staged_rows(lease.id).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows.last().unwrap().row_index, 5);
    }

    #[tokio::test]
    async fn test_missing_source_is_open_error() {
        let store = MemoryBatchStore::new();
        let source = StaticSource::new();
        let lease = leased(&store, "gone.csv").await;
        let cfg = IngestConfig::default();

        let err = IngestPipeline::new(&store, &source, &cfg).run(&lease).await.unwrap_err();
        assert!(matches!(err, PipelineError::Open(_)));
        assert_eq!(err.attempt_error_code(), Some(BatchErrorCode::SourceReadFailed));
    }

    #[test]
    fn test_preview_matches_pipeline_normalization() {
        let preview = preview_headers(&["\u{feff}ID", "Full Name", "", "email", "email"]);
        let normalized: Vec<_> = preview.columns.iter().map(|c| c.normalized.as_str()).collect();

        assert_eq!(normalized, normalize_headers(&["\u{feff}ID", "Full Name", "", "email", "email"]));
        assert_eq!(preview.columns[0].field, Some(Field::ExternalId));
        assert_eq!(preview.columns[1].field, Some(Field::FullName));
        assert_eq!(preview.columns[2].normalized, "column_3");
        assert_eq!(preview.columns[3].field, Some(Field::Email));
        assert_eq!(preview.columns[4].field, None);
        assert!(preview.missing_required.is_empty());
    }

    #[tokio::test]
    async fn test_preview_stream_reads_header_row() {
        let stream: SourceStream = Box::new(std::io::Cursor::new(b"name,phone\nAda,555\n".to_vec()));
        let preview = preview_stream(stream).await.unwrap();
        assert_eq!(preview.columns.len(), 2);
        assert_eq!(preview.missing_required, vec![Field::ExternalId]);
    }
}
