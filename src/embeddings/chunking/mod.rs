
use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Latin terminators need trailing whitespace to count as a boundary;
/// full-width CJK terminators end a sentence on their own.
static SENTENCE_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s+|[。！？]\s*").expect("valid regex"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkingError {
    #[error("Chunk size must be greater than zero")]
    ZeroChunkSize,
    #[error("Overlap size ({overlap_size}) must be smaller than chunk size ({chunk_size})")]
    OverlapTooLarge {
        overlap_size: usize,
        chunk_size: usize,
    },
}

/// A bounded, retrievable span of a source document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    /// Identifier, stable for a given source and chunk position
    pub id: String,
    /// Chunk text, starting with the overlap carried over from the previous chunk
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// Provenance of a chunk within its source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Name of the source document
    pub source: String,
    /// Position of this chunk within the source (0-based)
    pub chunk_index: usize,
    /// Number of chunks produced for the source
    pub total_chunks: usize,
    /// When the chunk was produced
    pub timestamp: DateTime<Utc>,
    /// Byte offset in the source where this chunk's own text begins
    pub start_offset: usize,
    /// Byte offset in the source where this chunk's own text ends
    pub end_offset: usize,
    /// Length in bytes of the prefix of `content` repeated from the previous chunk
    pub overlap_len: usize,
    /// Caller supplied key/value pairs
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Configuration for document chunking, sizes in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target upper bound for a chunk
    pub chunk_size: usize,
    /// Characters carried over from the end of one chunk into the next
    pub overlap_size: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap_size: 200,
        }
    }
}

impl ChunkingConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ChunkingError> {
        if self.chunk_size == 0 {
            return Err(ChunkingError::ZeroChunkSize);
        }
        if self.overlap_size >= self.chunk_size {
            return Err(ChunkingError::OverlapTooLarge {
                overlap_size: self.overlap_size,
                chunk_size: self.chunk_size,
            });
        }
        Ok(())
    }
}

/// Identifier of the chunk at `chunk_index` within `source`
#[inline]
pub fn chunk_id(source: &str, chunk_index: usize) -> String {
    format!("{}#{}", source, chunk_index)
}

impl DocumentChunk {
    /// Build a chunk directly, for callers that do their own splitting
    #[inline]
    pub fn new(
        source: &str,
        chunk_index: usize,
        total_chunks: usize,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let end_offset = content.len();
        Self {
            id: chunk_id(source, chunk_index),
            content,
            metadata: ChunkMetadata {
                source: source.to_string(),
                chunk_index,
                total_chunks,
                timestamp: Utc::now(),
                start_offset: 0,
                end_offset,
                overlap_len: 0,
                extra: BTreeMap::new(),
            },
        }
    }

    #[inline]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.extra.insert(key.into(), value.into());
        self
    }

    /// The part of `content` that is not repeated from the previous chunk
    #[inline]
    pub fn own_text(&self) -> &str {
        self.content.get(self.metadata.overlap_len..).unwrap_or_default()
    }

    /// Metadata stored alongside the chunk's vector in an index
    #[inline]
    pub fn record_metadata(&self) -> Map<String, Value> {
        let mut map: Map<String, Value> = self
            .metadata
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        map.insert("content".to_string(), Value::from(self.content.as_str()));
        map.insert("source".to_string(), Value::from(self.metadata.source.as_str()));
        map.insert("chunk_index".to_string(), Value::from(self.metadata.chunk_index));
        map.insert("total_chunks".to_string(), Value::from(self.metadata.total_chunks));
        map.insert(
            "timestamp".to_string(),
            Value::from(self.metadata.timestamp.to_rfc3339()),
        );
        map
    }
}

/// Splits source text into overlapping chunks along sentence boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentChunker {
    chunk_size: usize,
    overlap_size: usize,
}

/// Own span of a chunk plus the overlap that precedes it
struct PendingChunk {
    overlap: String,
    start: usize,
    end: usize,
}

impl DocumentChunker {
    #[inline]
    pub fn new(chunk_size: usize, overlap_size: usize) -> Result<Self, ChunkingError> {
        ChunkingConfig {
            chunk_size,
            overlap_size,
        }
        .validate()?;
        Ok(Self {
            chunk_size,
            overlap_size,
        })
    }

    #[inline]
    pub fn from_config(config: &ChunkingConfig) -> Result<Self, ChunkingError> {
        Self::new(config.chunk_size, config.overlap_size)
    }

    /// Chunk `text` from `source`.
    ///
    /// Sentences are accumulated greedily. A sentence longer than the chunk
    /// size is never split and ends up as an oversized chunk of its own.
    #[inline]
    #[expect(
        clippy::string_slice,
        reason = "offsets are sums of sentence lengths, always on char boundaries"
    )]
    pub fn chunk(&self, text: &str, source: &str) -> Vec<DocumentChunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut pending = Vec::new();
        let mut overlap = String::new();
        let mut overlap_chars = 0;
        let mut start = 0;
        let mut end = 0;
        let mut own_chars = 0;

        for sentence in split_sentences(text) {
            let sentence_chars = sentence.chars().count();

            if end > start && overlap_chars + own_chars + sentence_chars > self.chunk_size {
                let closed = format!("{}{}", overlap, &text[start..end]);
                let next_overlap = trailing_overlap(&closed, self.overlap_size);
                pending.push(PendingChunk {
                    overlap,
                    start,
                    end,
                });
                overlap_chars = next_overlap.chars().count();
                overlap = next_overlap;
                start = end;
                own_chars = 0;
            }

            end += sentence.len();
            own_chars += sentence_chars;
        }

        if end > start {
            pending.push(PendingChunk {
                overlap,
                start,
                end,
            });
        }

        let timestamp = Utc::now();
        let total_chunks = pending.len();
        let chunks: Vec<DocumentChunk> = pending
            .into_iter()
            .enumerate()
            .map(|(chunk_index, piece)| DocumentChunk {
                id: chunk_id(source, chunk_index),
                content: format!("{}{}", piece.overlap, &text[piece.start..piece.end]),
                metadata: ChunkMetadata {
                    source: source.to_string(),
                    chunk_index,
                    total_chunks,
                    timestamp,
                    start_offset: piece.start,
                    end_offset: piece.end,
                    overlap_len: piece.overlap.len(),
                    extra: BTreeMap::new(),
                },
            })
            .collect();

        debug!(
            "Chunked source '{}' into {} chunks (avg {} chars)",
            source,
            chunks.len(),
            chunks
                .iter()
                .map(|c| c.content.chars().count())
                .sum::<usize>()
                / chunks.len().max(1)
        );

        chunks
    }
}

/// Chunk `text` with the given sizes, rejecting an overlap that is not
/// smaller than the chunk size
#[inline]
pub fn chunk_text(
    text: &str,
    chunk_size: usize,
    overlap_size: usize,
    source: &str,
) -> Result<Vec<DocumentChunk>, ChunkingError> {
    Ok(DocumentChunker::new(chunk_size, overlap_size)?.chunk(text, source))
}

/// Split text into sentence units whose concatenation is exactly `text`
#[expect(clippy::string_slice, reason = "regex match offsets are char boundaries")]
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for boundary in SENTENCE_BOUNDARY.find_iter(text) {
        let Ok(boundary) = boundary else {
            break;
        };
        sentences.push(&text[start..boundary.end()]);
        start = boundary.end();
    }

    if start < text.len() {
        sentences.push(&text[start..]);
    }

    sentences
}

/// Last `overlap_size` characters of `content`, moved forward so the
/// overlap never starts in the middle of a word
#[expect(clippy::string_slice, reason = "offsets come from char_indices and find")]
fn trailing_overlap(content: &str, overlap_size: usize) -> String {
    if overlap_size == 0 {
        return String::new();
    }

    let total_chars = content.chars().count();
    let skip = total_chars.saturating_sub(overlap_size);
    let cut = content
        .char_indices()
        .nth(skip)
        .map_or(content.len(), |(i, _)| i);

    let mut tail = &content[cut..];
    let prev_is_space = content[..cut]
        .chars()
        .next_back()
        .is_none_or(char::is_whitespace);
    let starts_with_space = tail.chars().next().is_some_and(char::is_whitespace);

    if !prev_is_space && !starts_with_space {
        tail = tail
            .find(char::is_whitespace)
            .map_or("", |i| &tail[i..]);
    }

    tail.trim_start().to_string()
}
