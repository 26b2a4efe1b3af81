// Retrieval engine
// Embeds the query and searches the index; results are returned as the index ranked them


use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embeddings::{EmbeddingError, EmbeddingProvider, check_dimension};
use crate::index::{IndexError, SearchFilter, SearchResult, VectorIndex};
use crate::retry::{CallBudget, RetryPolicy};
use crate::Result;

const INDEX_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Query-time settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub max_context_chars: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Upper bound for each remote call (embed, search, generate)
    pub per_call_timeout_seconds: u64,
    /// Upper bound for a whole query
    pub query_timeout_seconds: u64,
    /// Attempts for a search that fails transiently
    pub index_retry_attempts: u32,
}

impl Default for RetrievalConfig {
    #[inline]
    fn default() -> Self {
        Self {
            top_k: 5,
            max_context_chars: 4000,
            temperature: 0.2,
            max_tokens: 512,
            per_call_timeout_seconds: 30,
            query_timeout_seconds: 120,
            index_retry_attempts: 3,
        }
    }
}

impl RetrievalConfig {
    #[inline]
    pub const fn per_call_timeout(&self) -> Duration {
        Duration::from_secs(self.per_call_timeout_seconds)
    }

    #[inline]
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }

    /// Fresh budget for a query starting now
    #[inline]
    pub fn budget(&self) -> CallBudget {
        CallBudget::new(self.per_call_timeout(), self.query_timeout())
    }
}

pub struct RetrievalEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    retry: RetryPolicy,
    per_call_timeout: Duration,
    query_timeout: Duration,
}

impl RetrievalEngine {
    #[inline]
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            retry: RetryPolicy::new(config.index_retry_attempts, INDEX_RETRY_BASE_DELAY),
            per_call_timeout: config.per_call_timeout(),
            query_timeout: config.query_timeout(),
        }
    }

    #[inline]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Nearest chunks to `query`, closest first
    #[inline]
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchResult>> {
        let budget = CallBudget::new(self.per_call_timeout, self.query_timeout);
        self.retrieve_within(query, top_k, filter, &budget).await
    }

    /// Same as [`Self::retrieve`], with every call bounded by an existing budget
    #[inline]
    pub async fn retrieve_within(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&SearchFilter>,
        budget: &CallBudget,
    ) -> Result<Vec<SearchResult>> {
        let embedding = self.embed_query(query, budget).await?;
        let results = self.search(&embedding, top_k, filter, budget).await?;
        debug!("Retrieved {} candidates for query", results.len());
        Ok(results)
    }

    /// Embed the query and check it against the index dimension
    #[inline]
    pub async fn embed_query(
        &self,
        query: &str,
        budget: &CallBudget,
    ) -> std::result::Result<Vec<f32>, EmbeddingError> {
        let embedding = budget
            .run(self.embedder.generate_embedding(query))
            .await
            .map_err(|_| EmbeddingError::Timeout)??;
        check_dimension(self.index.dimension(), &embedding)?;
        Ok(embedding)
    }

    /// Search the index, retrying transient failures while the query deadline allows
    #[inline]
    pub async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&SearchFilter>,
        budget: &CallBudget,
    ) -> std::result::Result<Vec<SearchResult>, IndexError> {
        let index = &self.index;
        self.retry
            .run(
                "index search",
                |e: &IndexError| e.is_transient() && !budget.query_expired(),
                move || async move {
                    budget
                        .run(index.search(embedding, top_k, filter))
                        .await
                        .unwrap_or_else(|_| {
                            Err(IndexError::Timeout {
                                operation: "search".to_string(),
                            })
                        })
                },
            )
            .await
    }
}
