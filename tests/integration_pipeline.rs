#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

// End-to-end tests for the query pipeline over the in-memory index
// Run with: cargo test --test integration_pipeline

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use docs_rag::RagError;
use docs_rag::config::Config;
use docs_rag::conversation::ConversationTurn;
use docs_rag::embeddings::chunking::DocumentChunk;
use docs_rag::embeddings::{
    EmbeddingError, EmbeddingProvider, HashingEmbedder, ProviderFingerprint,
};
use docs_rag::generation::{GenerationError, GenerationModel, GenerationRequest};
use docs_rag::index::{DistanceMetric, IndexError, InMemoryIndex, VectorIndex, VectorRecord};
use docs_rag::indexer::{IngestionError, SourceText};
use docs_rag::pipeline::GENERATION_FAILED_ANSWER;
use docs_rag::{RagPipeline, ResponseOutcome};

const DIMENSION: usize = 256;

const FAQ_DOCUMENT: &str = "FAQ: reset password. \
To reset password, open the login page and choose the forgot password link. \
A reset password email arrives within five minutes and the link stays valid for one hour. \
If the reset password email never arrives, check the spam folder before contacting support. \
Administrators can also reset password entries for managed accounts from the admin console. \
After you reset password credentials, every active session on other devices is signed out. \
Passwords must contain at least twelve characters and may not repeat the previous three.";

fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init()
        .ok(); // Ignore error if already initialized
}

/// Hashing embedder that remembers every text it was asked to embed
struct RecordingEmbedder {
    inner: HashingEmbedder,
    texts: Mutex<Vec<String>>,
}

impl RecordingEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HashingEmbedder::new(DIMENSION),
            texts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for RecordingEmbedder {
    fn dimension(&self) -> usize {
        DIMENSION
    }

    fn fingerprint(&self) -> ProviderFingerprint {
        ProviderFingerprint::new("test", "recording", DIMENSION)
    }

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.texts
            .lock()
            .expect("should lock texts")
            .push(text.to_string());
        self.inner.embed(text)
    }

    async fn generate_batch_embeddings(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|t| self.inner.embed(t)).collect()
    }
}

/// Generation model that answers from a fixed script and counts calls
struct ScriptedModel {
    answer: Result<String, GenerationError>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    fn answering(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Ok(answer.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            answer: Err(GenerationError::Request("service unavailable".to_string())),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl GenerationModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        assert!(request.prompt.contains("Context:"));
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}

fn pipeline(
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationModel>,
) -> (RagPipeline, Arc<InMemoryIndex>) {
    let index = Arc::new(InMemoryIndex::new(DIMENSION, DistanceMetric::Cosine));
    let pipeline = RagPipeline::new(embedder, index.clone(), generator, &Config::default())
        .expect("should build pipeline");
    (pipeline, index)
}

async fn ingest_faq(pipeline: &RagPipeline) -> usize {
    let report = pipeline
        .build_index_from_sources(&[SourceText::new("faq", FAQ_DOCUMENT)], 200, 40)
        .await
        .expect("should ingest FAQ");
    assert!(report.is_complete());
    report.indexed
}

#[tokio::test]
async fn faq_question_retrieves_reset_password_chunk() {
    init_test_tracing();
    let model = ScriptedModel::answering("Use the forgot password link on the login page [doc1].");
    let (pipeline, index) = pipeline(Arc::new(HashingEmbedder::new(DIMENSION)), model.clone());

    let indexed = ingest_faq(&pipeline).await;
    assert!(indexed >= 3, "FAQ should span several chunks, got {}", indexed);
    assert_eq!(index.count().await.expect("should count"), indexed);

    let top = pipeline
        .retrieval()
        .retrieve("how do I reset my password", 1, None)
        .await
        .expect("should retrieve");
    assert_eq!(top.len(), 1);
    assert!(
        top[0].content().is_some_and(|c| c.contains("reset password")),
        "top result was {:?}",
        top[0].content()
    );

    let response = pipeline
        .query("how do I reset my password", None)
        .await
        .expect("should answer");
    assert_eq!(response.outcome, ResponseOutcome::Answered);
    assert!(!response.sources.is_empty());
    assert!(response.sources.iter().all(|s| s.source == "faq"));
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn follow_up_is_rewritten_with_history_before_embedding() {
    let embedder = RecordingEmbedder::new();
    let (pipeline, _) = pipeline(embedder.clone(), ScriptedModel::answering("It autoscales."));
    ingest_faq(&pipeline).await;

    let history = vec![
        ConversationTurn::user("What is GKE?"),
        ConversationTurn::assistant("GKE is managed Kubernetes on Google Cloud."),
    ];
    pipeline
        .chat_with_history("and how does it scale?", &history, None)
        .await
        .expect("should answer");

    let texts = embedder.texts.lock().expect("should lock texts");
    let rewritten = texts.last().expect("query should be embedded");
    assert!(rewritten.contains("What is GKE?"));
    assert!(rewritten.contains("managed Kubernetes"));
    assert!(rewritten.ends_with("and how does it scale?"));
}

#[tokio::test]
async fn wrong_dimension_upsert_leaves_index_unchanged() {
    let index = InMemoryIndex::new(768, DistanceMetric::Cosine);
    let record = VectorRecord {
        id: "x".to_string(),
        embedding: vec![0.5; 512],
        metadata: serde_json::Map::new(),
    };

    let result = index.upsert(&[record]).await;

    assert_eq!(
        result,
        Err(IndexError::DimensionMismatch {
            id: "x".to_string(),
            expected: 768,
            actual: 512
        })
    );
    assert_eq!(index.count().await.expect("should count"), 0);
}

#[tokio::test]
async fn empty_chunk_in_large_batch_is_skipped() {
    let (pipeline, index) = pipeline(
        Arc::new(HashingEmbedder::new(DIMENSION)),
        ScriptedModel::answering("unused"),
    );
    let mut chunks: Vec<DocumentChunk> = (0..100)
        .map(|i| DocumentChunk::new("handbook", i, 100, format!("Handbook section {} covers policy {}.", i, i)))
        .collect();
    chunks[57].content = String::new();

    let report = pipeline.build_index(&chunks).await.expect("ingestion should complete");

    assert_eq!(report.indexed, 99);
    assert_eq!(index.count().await.expect("should count"), 99);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(
        report.skipped[0],
        IngestionError::EmptyChunk {
            id: "handbook#57".to_string()
        }
    );
}

#[tokio::test]
async fn failing_generation_returns_degraded_response() {
    let model = ScriptedModel::failing();
    let (pipeline, _) = pipeline(Arc::new(HashingEmbedder::new(DIMENSION)), model.clone());
    ingest_faq(&pipeline).await;

    let response = pipeline
        .query("how do I reset my password", None)
        .await
        .expect("generation failure should not be an error");

    assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    assert_eq!(response.outcome, ResponseOutcome::GenerationFailed);
    assert_eq!(response.answer, GENERATION_FAILED_ANSWER);
    assert!(!response.sources.is_empty());
    assert!(response.confidence.is_some_and(|c| c > 0.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sessions_keep_independent_histories() {
    let (pipeline, _) = pipeline(
        Arc::new(HashingEmbedder::new(DIMENSION)),
        ScriptedModel::answering("See the FAQ."),
    );
    ingest_faq(&pipeline).await;
    let manager = pipeline.conversation_manager();
    let first = manager.create_session();
    let second = manager.create_session();

    let (a, b) = tokio::join!(
        manager.chat(&pipeline, first, "how do I reset my password", None),
        manager.chat(&pipeline, second, "how long is the reset link valid", None),
    );
    a.expect("first session should answer");
    b.expect("second session should answer");

    manager
        .chat(&pipeline, first, "and if the email never arrives?", None)
        .await
        .expect("follow-up should answer");

    assert_eq!(manager.history(first).await.expect("session exists").len(), 4);
    assert_eq!(manager.history(second).await.expect("session exists").len(), 2);

    assert!(manager.end_session(second));
    assert!(matches!(
        manager.history(second).await,
        Err(RagError::UnknownSession(id)) if id == second
    ));
    assert_eq!(manager.session_count(), 1);
}
