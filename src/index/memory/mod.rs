// In-memory vector index
// Brute-force search; ties are broken by insertion order

#[cfg(test)]
mod tests;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    DistanceMetric, IndexError, SearchFilter, SearchResult, VectorIndex, VectorRecord,
    check_query_dimension, matches_filter, validate_dimensions,
};

/// Vector index held entirely in process memory.
///
/// Readers run concurrently; writers are serialized. Re-upserting an id
/// replaces the record in place, so it keeps its original insertion rank
/// for tie-breaking.
#[derive(Debug)]
pub struct InMemoryIndex {
    dimension: usize,
    metric: DistanceMetric,
    store: RwLock<Store>,
}

#[derive(Debug, Default)]
struct Store {
    records: Vec<VectorRecord>,
    positions: HashMap<String, usize>,
}

impl InMemoryIndex {
    #[inline]
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            store: RwLock::new(Store::default()),
        }
    }

    /// Fetch a stored record by id
    #[inline]
    pub async fn get(&self, id: &str) -> Option<VectorRecord> {
        let store = self.store.read().await;
        store
            .positions
            .get(id)
            .and_then(|&position| store.records.get(position))
            .cloned()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    #[inline]
    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), IndexError> {
        validate_dimensions(self.dimension, records)?;

        let mut store = self.store.write().await;
        for record in records {
            if let Some(&position) = store.positions.get(&record.id) {
                store.records[position] = record.clone();
            } else {
                let position = store.records.len();
                store.positions.insert(record.id.clone(), position);
                store.records.push(record.clone());
            }
        }

        debug!(
            "Upserted {} records, index now holds {}",
            records.len(),
            store.records.len()
        );
        Ok(())
    }

    #[inline]
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        check_query_dimension(self.dimension, query)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let store = self.store.read().await;
        let mut scored: Vec<(f32, &VectorRecord)> = store
            .records
            .iter()
            .filter(|record| filter.is_none_or(|f| matches_filter(&record.metadata, f)))
            .map(|record| (self.metric.distance(query, &record.embedding), record))
            .collect();

        // Stable sort keeps insertion order among equal distances
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(distance, record)| SearchResult {
                id: record.id.clone(),
                distance,
                metadata: record.metadata.clone(),
            })
            .collect())
    }

    #[inline]
    async fn count(&self) -> Result<usize, IndexError> {
        Ok(self.store.read().await.records.len())
    }
}
