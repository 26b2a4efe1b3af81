// Deterministic feature-hashing embedder
// Needs no model or network; lexical overlap drives similarity


use std::hash::{DefaultHasher, Hasher};

use async_trait::async_trait;

use super::{EmbeddingError, EmbeddingProvider, ProviderFingerprint};

const PROVIDER_NAME: &str = "hashing";
const MODEL_NAME: &str = "bag-of-words";

/// Hashes lower-cased alphanumeric tokens into `dimension` buckets and
/// L2-normalizes the counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    #[inline]
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// Embed synchronously
    #[inline]
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.dimension == 0 {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut vector = vec![0.0_f32; self.dimension];
        let mut tokens = 0_usize;

        for token in tokenize(text) {
            vector[self.bucket(&token)] += 1.0;
            tokens += 1;
        }

        if tokens == 0 {
            return Err(EmbeddingError::EmptyInput);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        for value in &mut vector {
            *value /= norm;
        }
        Ok(vector)
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        hasher.write(token.as_bytes());
        (hasher.finish() % self.dimension as u64) as usize
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    fn fingerprint(&self) -> ProviderFingerprint {
        ProviderFingerprint::new(PROVIDER_NAME, MODEL_NAME, self.dimension)
    }

    #[inline]
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed(text)
    }
}
