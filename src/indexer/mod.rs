// Ingestion module
// Embeds chunks in bounded-concurrency batches and upserts them into the vector index


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::embeddings::chunking::{DocumentChunk, DocumentChunker};
use crate::embeddings::{EmbeddingError, EmbeddingProvider, check_dimension};
use crate::index::{IndexError, VectorIndex, VectorRecord};
use crate::retry::RetryPolicy;
use crate::Result;

/// Why a single chunk was left out of the index
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IngestionError {
    #[error("Chunk '{id}' has no content")]
    EmptyChunk { id: String },
    #[error("Chunk '{id}' is malformed: {reason}")]
    MalformedChunk { id: String, reason: String },
    #[error("Failed to embed chunk '{id}': {source}")]
    Embedding {
        id: String,
        #[source]
        source: EmbeddingError,
    },
}

impl IngestionError {
    /// Id of the chunk that was skipped
    #[inline]
    pub fn chunk_id(&self) -> &str {
        match self {
            Self::EmptyChunk { id }
            | Self::MalformedChunk { id, .. }
            | Self::Embedding { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Chunks embedded per provider call
    pub batch_size: usize,
    /// Batches in flight at once
    pub max_concurrency: usize,
    /// Attempts for an embedding or upsert call that fails transiently
    pub embed_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for IngestionConfig {
    #[inline]
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_concurrency: 4,
            embed_retry_attempts: 3,
            retry_base_delay_ms: 500,
        }
    }
}

impl IngestionConfig {
    #[inline]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.embed_retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }
}

/// Raw text of one source document, read by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceText {
    pub source: String,
    pub text: String,
}

impl SourceText {
    #[inline]
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
        }
    }
}

/// Outcome of an ingestion run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestionReport {
    /// Records written to the index
    pub indexed: usize,
    /// Chunks left out, with the reason for each
    pub skipped: Vec<IngestionError>,
}

impl IngestionReport {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    fn merge(&mut self, other: Self) {
        self.indexed += other.indexed;
        self.skipped.extend(other.skipped);
    }
}

/// Writes chunks into a vector index
pub struct Indexer {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    config: IngestionConfig,
    retry: RetryPolicy,
}

impl Indexer {
    #[inline]
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        config: IngestionConfig,
    ) -> Self {
        let retry = config.retry_policy();
        Self {
            embedder,
            index,
            config,
            retry,
        }
    }

    /// Chunk every source and index the result
    #[inline]
    pub async fn build_index_from_sources(
        &self,
        sources: &[SourceText],
        chunk_size: usize,
        overlap_size: usize,
    ) -> Result<IngestionReport> {
        let chunker = DocumentChunker::new(chunk_size, overlap_size)?;
        let chunks: Vec<DocumentChunk> = sources
            .iter()
            .flat_map(|source| chunker.chunk(&source.text, &source.source))
            .collect();

        info!(
            "Chunked {} sources into {} chunks",
            sources.len(),
            chunks.len()
        );
        self.build_index(&chunks).await
    }

    /// Embed and upsert `chunks`.
    ///
    /// Invalid chunks and chunks whose embedding keeps failing are skipped
    /// and listed in the report; the rest of the batch continues. A
    /// persistent index failure aborts the run.
    #[inline]
    pub async fn build_index(&self, chunks: &[DocumentChunk]) -> Result<IngestionReport> {
        let mut report = IngestionReport::default();
        let mut seen = HashSet::with_capacity(chunks.len());
        let mut valid = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            match validate_chunk(chunk) {
                Ok(()) if !seen.insert(chunk.id.as_str()) => {
                    record_skip(
                        &mut report,
                        IngestionError::MalformedChunk {
                            id: chunk.id.clone(),
                            reason: "duplicate id in ingestion batch".to_string(),
                        },
                    );
                }
                Ok(()) => valid.push(chunk),
                Err(e) => record_skip(&mut report, e),
            }
        }

        let batch_size = self.config.batch_size.max(1);
        let max_concurrency = self.config.max_concurrency.max(1);
        info!(
            "Indexing {} chunks in batches of {} ({} in flight)",
            valid.len(),
            batch_size,
            max_concurrency
        );

        let outcomes: Vec<std::result::Result<IngestionReport, IndexError>> =
            stream::iter(valid.chunks(batch_size))
                .map(|batch| self.process_batch(batch))
                .buffer_unordered(max_concurrency)
                .collect()
                .await;

        let mut failure = None;
        for outcome in outcomes {
            match outcome {
                Ok(batch_report) => report.merge(batch_report),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            warn!("Ingestion aborted by index failure: {}", e);
            return Err(e.into());
        }

        info!(
            "Ingestion finished: {} indexed, {} skipped",
            report.indexed,
            report.skipped.len()
        );
        Ok(report)
    }

    async fn process_batch(
        &self,
        batch: &[&DocumentChunk],
    ) -> std::result::Result<IngestionReport, IndexError> {
        let mut report = IngestionReport::default();

        let embeddings = match self.embed_batch(batch).await {
            Ok(embeddings) => embeddings.into_iter().map(Ok).collect(),
            Err(e) => {
                warn!(
                    "Batch embedding of {} chunks failed: {}, falling back to single chunks",
                    batch.len(),
                    e
                );
                let mut single = Vec::with_capacity(batch.len());
                for chunk in batch {
                    single.push(self.embed_single(chunk).await);
                }
                single
            }
        };

        let mut records = Vec::with_capacity(batch.len());
        for (chunk, embedding) in batch.iter().zip(embeddings) {
            match embedding {
                Ok(embedding) => records.push(VectorRecord::from_chunk(chunk, embedding)),
                Err(source) => record_skip(
                    &mut report,
                    IngestionError::Embedding {
                        id: chunk.id.clone(),
                        source,
                    },
                ),
            }
        }

        if records.is_empty() {
            return Ok(report);
        }

        let index = &self.index;
        let records_ref = &records;
        self.retry
            .run("index upsert", IndexError::is_transient, move || async move {
                index.upsert(records_ref).await
            })
            .await?;

        debug!("Stored batch of {} embeddings", records.len());
        report.indexed = records.len();
        Ok(report)
    }

    /// One provider call for the whole batch, every vector checked
    async fn embed_batch(
        &self,
        batch: &[&DocumentChunk],
    ) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        let texts: Vec<String> = batch.iter().map(|chunk| chunk.content.clone()).collect();
        let embedder = &self.embedder;
        let texts_ref = &texts;
        let embeddings = self
            .retry
            .run(
                "batch embedding",
                EmbeddingError::is_transient,
                move || async move { embedder.generate_batch_embeddings(texts_ref).await },
            )
            .await?;

        if embeddings.len() != batch.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                embeddings.len()
            )));
        }
        for embedding in &embeddings {
            check_dimension(self.index.dimension(), embedding)?;
        }
        Ok(embeddings)
    }

    async fn embed_single(
        &self,
        chunk: &DocumentChunk,
    ) -> std::result::Result<Vec<f32>, EmbeddingError> {
        let embedder = &self.embedder;
        let content = chunk.content.as_str();
        let embedding = self
            .retry
            .run(
                "chunk embedding",
                EmbeddingError::is_transient,
                move || async move { embedder.generate_embedding(content).await },
            )
            .await?;
        check_dimension(self.index.dimension(), &embedding)?;
        Ok(embedding)
    }
}

fn validate_chunk(chunk: &DocumentChunk) -> std::result::Result<(), IngestionError> {
    if chunk.id.trim().is_empty() {
        return Err(IngestionError::MalformedChunk {
            id: chunk.id.clone(),
            reason: "missing id".to_string(),
        });
    }
    if chunk.content.trim().is_empty() {
        return Err(IngestionError::EmptyChunk {
            id: chunk.id.clone(),
        });
    }
    let metadata = &chunk.metadata;
    if metadata.chunk_index >= metadata.total_chunks {
        return Err(IngestionError::MalformedChunk {
            id: chunk.id.clone(),
            reason: format!(
                "chunk index {} is not below total chunks {}",
                metadata.chunk_index, metadata.total_chunks
            ),
        });
    }
    Ok(())
}

fn record_skip(report: &mut IngestionReport, error: IngestionError) {
    warn!("Skipping chunk: {}", error);
    report.skipped.push(error);
}
