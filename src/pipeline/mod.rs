// Query pipeline
// Wires ingestion, retrieval, context assembly, confidence and answer synthesis together


use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::confidence;
use crate::context::ContextAssembler;
use crate::conversation::{ConversationConfig, ConversationManager, ConversationTurn, rewrite_query};
use crate::embeddings::chunking::DocumentChunk;
use crate::embeddings::{
    CachedEmbeddingProvider, EmbeddingCache, EmbeddingError, EmbeddingProvider, OllamaClient,
};
use crate::generation::{AnswerSynthesizer, GenerationError, GenerationModel};
use crate::index::{IndexBackend, InMemoryIndex, LanceIndex, SearchResult, VectorIndex};
use crate::indexer::{Indexer, IngestionReport, SourceText};
use crate::retrieval::{RetrievalConfig, RetrievalEngine};
use crate::{RagError, Result};

/// Answer returned when retrieval finds nothing; no model call is made
pub const NO_RELEVANT_INFORMATION_ANSWER: &str =
    "No relevant information was found to answer this question.";

/// Answer returned when the model fails after its retry
pub const GENERATION_FAILED_ANSWER: &str =
    "Answer generation failed. The retrieved sources are listed for reference.";

/// Per-query overrides; unset fields fall back to the retrieval settings
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl QueryOptions {
    #[inline]
    pub const fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    #[inline]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[inline]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOutcome {
    Answered,
    NoRelevantInformation,
    GenerationFailed,
}

/// A chunk that went into the answer's context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReference {
    pub id: String,
    pub content: String,
    pub source: String,
    /// `None` when the index metric has no normalized range
    pub relevance_score: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagResponse {
    pub answer: String,
    pub sources: Vec<SourceReference>,
    pub context: Option<String>,
    /// Heuristic in `[0, 1]`; `None` when it cannot be derived for the metric
    pub confidence: Option<f32>,
    pub outcome: ResponseOutcome,
}

impl RagResponse {
    fn no_relevant_information() -> Self {
        Self {
            answer: NO_RELEVANT_INFORMATION_ANSWER.to_string(),
            sources: Vec::new(),
            context: None,
            confidence: Some(0.0),
            outcome: ResponseOutcome::NoRelevantInformation,
        }
    }
}

/// Progress of one query, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryStage {
    QueryReceived,
    QueryEmbedded,
    CandidatesRetrieved,
    ContextAssembled,
    AnswerSynthesized,
    ResponseReturned,
    EmptyResponse,
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::QueryReceived => "query received",
            Self::QueryEmbedded => "query embedded",
            Self::CandidatesRetrieved => "candidates retrieved",
            Self::ContextAssembled => "context assembled",
            Self::AnswerSynthesized => "answer synthesized",
            Self::ResponseReturned => "response returned",
            Self::EmptyResponse => "empty response",
        };
        f.write_str(name)
    }
}

fn enter(stage: QueryStage) {
    debug!("Query stage: {}", stage);
}

/// Retrieval-augmented question answering over an injected embedder,
/// vector index and generation model
pub struct RagPipeline {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    indexer: Indexer,
    retrieval: RetrievalEngine,
    assembler: ContextAssembler,
    synthesizer: AnswerSynthesizer,
    retrieval_config: RetrievalConfig,
    conversation_config: ConversationConfig,
}

impl RagPipeline {
    /// Assemble a pipeline from its collaborators.
    ///
    /// Fails if the embedder and the index disagree on vector dimension.
    #[inline]
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn GenerationModel>,
        config: &Config,
    ) -> Result<Self> {
        if embedder.dimension() != index.dimension() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: index.dimension(),
                actual: embedder.dimension(),
            }
            .into());
        }

        info!(
            "Pipeline ready: {}-dimensional {:?} index, generator {}",
            index.dimension(),
            index.metric(),
            generator.model_name()
        );

        Ok(Self {
            indexer: Indexer::new(
                Arc::clone(&embedder),
                Arc::clone(&index),
                config.ingestion.clone(),
            ),
            retrieval: RetrievalEngine::new(
                Arc::clone(&embedder),
                Arc::clone(&index),
                &config.retrieval,
            ),
            assembler: ContextAssembler::new(config.retrieval.max_context_chars),
            synthesizer: AnswerSynthesizer::new(generator),
            retrieval_config: config.retrieval.clone(),
            conversation_config: config.conversation.clone(),
            embedder,
            index,
        })
    }

    /// Build the Ollama-backed pipeline described by `config`
    #[inline]
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        // Retries belong to the indexer, retrieval and synthesizer policies;
        // the client makes a single HTTP attempt per call
        let client = Arc::new(OllamaClient::new(&config.ollama)?.with_retry_attempts(1));
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(CachedEmbeddingProvider::new(
            Arc::clone(&client) as Arc<dyn EmbeddingProvider>,
            Arc::new(EmbeddingCache::default()),
        ));
        let dimension = embedder.dimension();

        let index: Arc<dyn VectorIndex> = match config.index.backend {
            IndexBackend::Memory => Arc::new(InMemoryIndex::new(dimension, config.index.metric)),
            IndexBackend::Lancedb => Arc::new(
                LanceIndex::open(
                    &config.vector_database_path(),
                    &config.index.table_name,
                    dimension,
                    config.index.metric,
                )
                .await?,
            ),
        };

        Self::new(embedder, index, client, config)
    }

    #[inline]
    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    #[inline]
    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    #[inline]
    pub fn retrieval(&self) -> &RetrievalEngine {
        &self.retrieval
    }

    /// Session store using this pipeline's conversation settings
    #[inline]
    pub fn conversation_manager(&self) -> ConversationManager {
        ConversationManager::new(self.conversation_config.clone())
    }

    #[inline]
    pub async fn build_index(&self, chunks: &[DocumentChunk]) -> Result<IngestionReport> {
        self.indexer.build_index(chunks).await
    }

    #[inline]
    pub async fn build_index_from_sources(
        &self,
        sources: &[SourceText],
        chunk_size: usize,
        overlap_size: usize,
    ) -> Result<IngestionReport> {
        self.indexer
            .build_index_from_sources(sources, chunk_size, overlap_size)
            .await
    }

    /// Answer a standalone question
    #[inline]
    pub async fn query(&self, question: &str, options: Option<QueryOptions>) -> Result<RagResponse> {
        self.answer(question, options.unwrap_or_default()).await
    }

    /// Answer a follow-up question, folding recent turns into the query
    #[inline]
    pub async fn chat_with_history(
        &self,
        question: &str,
        history: &[ConversationTurn],
        options: Option<QueryOptions>,
    ) -> Result<RagResponse> {
        let rewritten = rewrite_query(question, history, self.conversation_config.rewrite_turns);
        debug!(
            "Rewrote question with {} history turns",
            history.len().min(self.conversation_config.rewrite_turns)
        );
        self.answer(&rewritten, options.unwrap_or_default()).await
    }

    async fn answer(&self, question: &str, options: QueryOptions) -> Result<RagResponse> {
        let top_k = options.top_k.unwrap_or(self.retrieval_config.top_k);
        let temperature = options
            .temperature
            .unwrap_or(self.retrieval_config.temperature);
        let max_tokens = options.max_tokens.unwrap_or(self.retrieval_config.max_tokens);
        let budget = self.retrieval_config.budget();

        enter(QueryStage::QueryReceived);
        let embedding = self.retrieval.embed_query(question, &budget).await?;

        enter(QueryStage::QueryEmbedded);
        let candidates = self
            .retrieval
            .search(&embedding, top_k, None, &budget)
            .await?;

        enter(QueryStage::CandidatesRetrieved);
        if candidates.is_empty() {
            enter(QueryStage::EmptyResponse);
            info!("No candidates retrieved, skipping generation");
            return Ok(RagResponse::no_relevant_information());
        }

        let assembled = self.assembler.assemble(&candidates);
        enter(QueryStage::ContextAssembled);

        let metric = self.index.metric();
        let confidence = confidence::estimate(&assembled.used_results, metric);
        let sources = assembled
            .used_results
            .iter()
            .map(|result| source_reference(result, metric.relevance(result.distance)))
            .collect();

        let (answer, outcome) = match self
            .synthesizer
            .synthesize(question, &assembled.context, temperature, max_tokens, &budget)
            .await
        {
            Ok(answer) => {
                enter(QueryStage::AnswerSynthesized);
                (answer, ResponseOutcome::Answered)
            }
            Err(e) if budget.query_expired() => {
                warn!("Query deadline expired during generation: {}", e);
                return Err(RagError::Generation(GenerationError::Timeout));
            }
            Err(e) => {
                warn!("Returning degraded response after generation failure: {}", e);
                (
                    GENERATION_FAILED_ANSWER.to_string(),
                    ResponseOutcome::GenerationFailed,
                )
            }
        };

        enter(QueryStage::ResponseReturned);
        Ok(RagResponse {
            answer,
            sources,
            context: Some(assembled.context),
            confidence,
            outcome,
        })
    }
}

fn source_reference(result: &SearchResult, relevance_score: Option<f32>) -> SourceReference {
    SourceReference {
        id: result.id.clone(),
        content: result.content().unwrap_or_default().to_string(),
        source: result.source().unwrap_or("unknown").to_string(),
        relevance_score,
    }
}
