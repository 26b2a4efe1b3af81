// Embeddings module
// Chunking of source text and the providers that turn text into vectors

pub mod cache;
pub mod chunking;
pub mod hashing;
pub mod ollama;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

pub use cache::{CachedEmbeddingProvider, EmbeddingCache, EmbeddingCacheKey};
pub use chunking::{ChunkingConfig, DocumentChunk, DocumentChunker, chunk_text};
pub use hashing::HashingEmbedder;
pub use ollama::OllamaClient;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("Authentication rejected by embedding provider: {0}")]
    Auth(String),
    #[error("Embedding provider quota exceeded: {0}")]
    Quota(String),
    #[error("Embedding request timed out")]
    Timeout,
    #[error("Embedding provider unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid embedding response: {0}")]
    InvalidResponse(String),
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Cannot embed empty text")]
    EmptyInput,
}

impl EmbeddingError {
    /// Whether retrying the same request may succeed
    #[inline]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Quota(_) | Self::Timeout | Self::Unavailable(_))
    }
}

/// Identity of an embedding configuration: two providers with equal
/// fingerprints produce interchangeable vectors
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderFingerprint {
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    /// Any other settings that influence the produced vectors
    pub options: BTreeMap<String, String>,
}

impl ProviderFingerprint {
    #[inline]
    pub fn new(provider: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            dimension,
            options: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Turns text into fixed-dimension vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Dimension of every vector this provider returns
    fn dimension(&self) -> usize;

    fn fingerprint(&self) -> ProviderFingerprint;

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed several texts, one vector per input in input order
    async fn generate_batch_embeddings(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.generate_embedding(text).await?);
        }
        Ok(embeddings)
    }
}

/// Check a vector against the expected dimension
#[inline]
pub fn check_dimension(expected: usize, embedding: &[f32]) -> Result<(), EmbeddingError> {
    if embedding.len() == expected {
        Ok(())
    } else {
        Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: embedding.len(),
        })
    }
}
