// Vector index module
// The storage contract consumed by retrieval, plus in-memory and LanceDB implementations


pub mod lance;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::embeddings::chunking::DocumentChunk;

pub use lance::LanceIndex;
pub use memory::InMemoryIndex;

/// Metadata stored with each vector
pub type Metadata = Map<String, Value>;

/// Exact-match constraints on metadata keys
pub type SearchFilter = BTreeMap<String, Value>;

/// Pseudo id reported when a query vector has the wrong dimension
pub const QUERY_VECTOR_ID: &str = "<query>";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndexError {
    #[error("Vector '{id}' has dimension {actual}, index expects {expected}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        actual: usize,
    },
    #[error("Index operation timed out: {operation}")]
    Timeout { operation: String },
    #[error("Index temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("Index backend failure: {0}")]
    Backend(String),
    #[error("Unsupported filter: {0}")]
    UnsupportedFilter(String),
}

impl IndexError {
    /// Timeouts and unavailability are worth retrying; everything else is persistent
    #[inline]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable(_))
    }
}

/// A chunk's embedding ready for storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Matches the id of the chunk the vector was computed from
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

impl VectorRecord {
    #[inline]
    pub fn from_chunk(chunk: &DocumentChunk, embedding: Vec<f32>) -> Self {
        Self {
            id: chunk.id.clone(),
            embedding,
            metadata: chunk.record_metadata(),
        }
    }
}

/// A stored vector matched by a search, nearest first
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub id: String,
    /// Distance to the query under the index's metric
    pub distance: f32,
    pub metadata: Metadata,
}

impl SearchResult {
    #[inline]
    pub fn content(&self) -> Option<&str> {
        self.metadata.get("content").and_then(Value::as_str)
    }

    #[inline]
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").and_then(Value::as_str)
    }
}

/// Distance metric, fixed when an index is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cos(a, b)`, in `[0, 2]`
    #[default]
    Cosine,
    /// Squared Euclidean distance, unbounded
    SquaredL2,
    /// `1 - a·b`, unbounded for vectors that are not unit length
    Dot,
}

impl DistanceMetric {
    #[inline]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => {
                let dot = dot(a, b);
                let norms = dot_self(a).sqrt() * dot_self(b).sqrt();
                if norms == 0.0 { 1.0 } else { (1.0 - dot / norms).clamp(0.0, 2.0) }
            }
            Self::SquaredL2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
            Self::Dot => 1.0 - dot(a, b),
        }
    }

    /// Declared distance range, if the metric is normalized
    #[inline]
    pub const fn normalized_range(self) -> Option<(f32, f32)> {
        match self {
            Self::Cosine => Some((0.0, 2.0)),
            Self::SquaredL2 | Self::Dot => None,
        }
    }

    /// Relevance in `[0, 1]` for one distance, or `None` when the metric
    /// has no normalized range to derive it from
    #[inline]
    pub fn relevance(self, distance: f32) -> Option<f32> {
        self.normalized_range()
            .map(|_| (1.0 - distance).clamp(0.0, 1.0))
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn dot_self(a: &[f32]) -> f32 {
    dot(a, a)
}

/// Which index implementation to build from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexBackend {
    #[default]
    Memory,
    Lancedb,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub backend: IndexBackend,
    pub metric: DistanceMetric,
    /// Table name used by persistent backends
    pub table_name: String,
}

impl Default for IndexConfig {
    #[inline]
    fn default() -> Self {
        Self {
            backend: IndexBackend::Memory,
            metric: DistanceMetric::Cosine,
            table_name: "chunks".to_string(),
        }
    }
}

/// Stores vectors with metadata and answers nearest-neighbour queries
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn dimension(&self) -> usize;

    fn metric(&self) -> DistanceMetric;

    /// Insert or replace records by id. Either every record is written or,
    /// on a dimension mismatch, none is.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), IndexError>;

    /// At most `top_k` results ordered by ascending distance
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchResult>, IndexError>;

    async fn count(&self) -> Result<usize, IndexError>;
}

/// Reject the whole batch if any record has the wrong dimension
#[inline]
pub fn validate_dimensions(expected: usize, records: &[VectorRecord]) -> Result<(), IndexError> {
    match records.iter().find(|r| r.embedding.len() != expected) {
        Some(record) => Err(IndexError::DimensionMismatch {
            id: record.id.clone(),
            expected,
            actual: record.embedding.len(),
        }),
        None => Ok(()),
    }
}

#[inline]
pub fn check_query_dimension(expected: usize, query: &[f32]) -> Result<(), IndexError> {
    if query.len() == expected {
        Ok(())
    } else {
        Err(IndexError::DimensionMismatch {
            id: QUERY_VECTOR_ID.to_string(),
            expected,
            actual: query.len(),
        })
    }
}

/// Whether every filter key is present in `metadata` with an equal value
#[inline]
pub fn matches_filter(metadata: &Metadata, filter: &SearchFilter) -> bool {
    filter
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}
