use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Chunking error: {0}")]
    Chunking(#[from] embeddings::chunking::ChunkingError),

    #[error("Ingestion error: {0}")]
    Ingestion(#[from] indexer::IngestionError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] embeddings::EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] index::IndexError),

    #[error("Generation error: {0}")]
    Generation(#[from] generation::GenerationError),

    #[error("Unknown conversation session: {0}")]
    UnknownSession(Uuid),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub mod confidence;
pub mod config;
pub mod context;
pub mod conversation;
pub mod embeddings;
pub mod generation;
pub mod index;
pub mod indexer;
pub mod pipeline;
pub mod retrieval;
pub mod retry;

pub use pipeline::{QueryOptions, RagPipeline, RagResponse, ResponseOutcome, SourceReference};
