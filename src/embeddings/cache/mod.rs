// Embedding cache
// Keyed by the provider fingerprint plus normalized text, compared by value


use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use itertools::Itertools;
use tracing::debug;

use super::{EmbeddingError, EmbeddingProvider, ProviderFingerprint};

const DEFAULT_CAPACITY: usize = 1024;

/// Cache key for one embedding
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmbeddingCacheKey {
    pub fingerprint: ProviderFingerprint,
    pub normalized_text: String,
}

impl EmbeddingCacheKey {
    #[inline]
    pub fn new(fingerprint: ProviderFingerprint, text: &str) -> Self {
        Self {
            fingerprint,
            normalized_text: normalize_text(text),
        }
    }
}

/// Trim and collapse runs of whitespace to a single space
#[inline]
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<EmbeddingCacheKey, Vec<f32>>,
    insertion_order: VecDeque<EmbeddingCacheKey>,
}

/// Bounded in-memory embedding cache; the oldest entry is evicted first
#[derive(Debug)]
pub struct EmbeddingCache {
    capacity: usize,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for EmbeddingCache {
    #[inline]
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EmbeddingCache {
    #[inline]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn get(&self, key: &EmbeddingCacheKey) -> Option<Vec<f32>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let found = state.entries.get(key).cloned();
        drop(state);

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    #[inline]
    pub fn insert(&self, key: EmbeddingCacheKey, embedding: Vec<f32>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.entries.insert(key.clone(), embedding).is_none() {
            state.insertion_order.push_back(key);
        }

        while state.entries.len() > self.capacity {
            let Some(oldest) = state.insertion_order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
        }
    }

    #[inline]
    pub fn stats(&self) -> CacheStats {
        let entries = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}

/// Wraps a provider so repeated texts are served from an injected cache
pub struct CachedEmbeddingProvider {
    inner: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
}

impl CachedEmbeddingProvider {
    #[inline]
    pub fn new(inner: Arc<dyn EmbeddingProvider>, cache: Arc<EmbeddingCache>) -> Self {
        Self { inner, cache }
    }

    #[inline]
    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbeddingProvider {
    #[inline]
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    #[inline]
    fn fingerprint(&self) -> ProviderFingerprint {
        self.inner.fingerprint()
    }

    #[inline]
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let key = EmbeddingCacheKey::new(self.inner.fingerprint(), text);
        if let Some(embedding) = self.cache.get(&key) {
            return Ok(embedding);
        }

        let embedding = self.inner.generate_embedding(text).await?;
        self.cache.insert(key, embedding.clone());
        Ok(embedding)
    }

    #[inline]
    async fn generate_batch_embeddings(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let fingerprint = self.inner.fingerprint();
        let keys: Vec<EmbeddingCacheKey> = texts
            .iter()
            .map(|text| EmbeddingCacheKey::new(fingerprint.clone(), text))
            .collect();

        let mut results: Vec<Option<Vec<f32>>> = keys.iter().map(|k| self.cache.get(k)).collect();
        let missing: Vec<usize> = results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.is_none().then_some(i))
            .collect();

        if !missing.is_empty() {
            debug!(
                "Embedding cache missed {} of {} texts",
                missing.len(),
                texts.len()
            );
            let missing_texts: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let embeddings = self.inner.generate_batch_embeddings(&missing_texts).await?;
            if embeddings.len() != missing.len() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    missing.len(),
                    embeddings.len()
                )));
            }

            for (index, embedding) in missing.into_iter().zip(embeddings) {
                self.cache.insert(keys[index].clone(), embedding.clone());
                results[index] = Some(embedding);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}
