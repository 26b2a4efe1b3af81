
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::OllamaConfig;
use crate::embeddings::{EmbeddingError, EmbeddingProvider, ProviderFingerprint, check_dimension};
use crate::generation::{GenerationError, GenerationModel, GenerationRequest};

pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 768;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const EXPONENTIAL_BACKOFF_BASE: u32 = 2;
const PROVIDER_NAME: &str = "ollama";

/// HTTP client for an Ollama server, serving both embeddings and text generation
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: Url,
    embedding_model: String,
    generation_model: String,
    batch_size: u32,
    embedding_dimension: usize,
    agent: ureq::Agent,
    retry_attempts: u32,
    retry_delay: Duration,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
    pub details: Option<ModelDetails>,
}

#[derive(Debug, Deserialize)]
pub struct ModelDetails {
    pub format: Option<String>,
    pub family: Option<String>,
    pub families: Option<Vec<String>>,
    pub parameter_size: Option<String>,
    pub quantization_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

/// Why an HTTP exchange with the server failed
#[derive(Debug, Error)]
enum RequestFailure {
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("caller stopped waiting for the request")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl From<RequestFailure> for EmbeddingError {
    fn from(failure: RequestFailure) -> Self {
        match failure {
            RequestFailure::Status(401 | 403) => Self::Auth(failure.to_string()),
            RequestFailure::Status(429) => Self::Quota(failure.to_string()),
            RequestFailure::Status(status) if status >= 500 => {
                Self::Unavailable(failure.to_string())
            }
            RequestFailure::Timeout | RequestFailure::Cancelled => Self::Timeout,
            RequestFailure::Transport(message) => Self::Unavailable(message),
            RequestFailure::Status(_) | RequestFailure::Other(_) => {
                Self::InvalidResponse(failure.to_string())
            }
        }
    }
}

impl From<RequestFailure> for GenerationError {
    fn from(failure: RequestFailure) -> Self {
        match failure {
            RequestFailure::Timeout | RequestFailure::Cancelled => Self::Timeout,
            RequestFailure::Status(401 | 403) => Self::Rejected(failure.to_string()),
            other => Self::Request(other.to_string()),
        }
    }
}

/// Tells a blocking request loop that nobody awaits its result any more.
///
/// The async side holds the matching sender; dropping it (the awaiting
/// future was cancelled by a deadline) disconnects the channel.
struct CancelSignal(Option<mpsc::Receiver<()>>);

impl CancelSignal {
    const fn never() -> Self {
        Self(None)
    }

    fn is_cancelled(&self) -> bool {
        self.0
            .as_ref()
            .is_some_and(|rx| matches!(rx.try_recv(), Err(TryRecvError::Disconnected)))
    }

    /// Sleep for `delay`; returns `false` if cancelled before it elapsed
    fn sleep(&self, delay: Duration) -> bool {
        match &self.0 {
            None => {
                std::thread::sleep(delay);
                true
            }
            Some(rx) => !matches!(rx.recv_timeout(delay), Err(RecvTimeoutError::Disconnected)),
        }
    }
}

impl OllamaClient {
    #[inline]
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let base_url = config
            .ollama_url()
            .context("Failed to generate Ollama URL from config")?;

        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_seconds)))
            .build()
            .into();

        Ok(Self {
            base_url,
            embedding_model: config.embedding_model.clone(),
            generation_model: config.generation_model.clone(),
            batch_size: config.batch_size,
            embedding_dimension: config.embedding_dimension as usize,
            agent,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        self
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Delay before the first retry; doubled for every following one
    #[inline]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Test connection to Ollama server and verify both models are available
    #[inline]
    pub fn health_check(&self) -> Result<()> {
        debug!("Performing health check for Ollama at {}", self.base_url);

        let models = self.list_models().context("Server ping failed")?;
        for model in [&self.embedding_model, &self.generation_model] {
            if !models.iter().any(|m| &m.name == model) {
                let available_models: Vec<&str> =
                    models.iter().map(|m| m.name.as_str()).collect();
                warn!(
                    "Model {} not found. Available models: {:?}",
                    model, available_models
                );
                return Err(anyhow::anyhow!(
                    "Model '{}' is not available. Available models: {:?}",
                    model,
                    available_models
                ));
            }
        }

        info!(
            "Health check passed for Ollama server at {} with models {} and {}",
            self.base_url, self.embedding_model, self.generation_model
        );
        Ok(())
    }

    /// List all available models
    #[inline]
    pub fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self
            .base_url
            .join("/api/tags")
            .context("Failed to build models URL")?;

        debug!("Fetching available models from {}", url);

        let response_text = self
            .make_request_with_retry(&CancelSignal::never(), || {
                self.agent
                    .get(url.as_str())
                    .call()
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })
            .context("Failed to fetch models")?;

        let models_response: ModelsResponse =
            serde_json::from_str(&response_text).context("Failed to parse models response")?;

        debug!("Found {} models", models_response.models.len());
        Ok(models_response.models)
    }

    /// Embed texts in batches of `batch_size`, blocking the current thread
    fn embed_blocking(
        &self,
        texts: &[String],
        cancel: &CancelSignal,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = self
            .base_url
            .join("/api/embed")
            .map_err(|e| EmbeddingError::InvalidResponse(format!("bad embed URL: {}", e)))?;

        let mut results = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_size.max(1) as usize) {
            let request = EmbedRequest {
                model: &self.embedding_model,
                input: batch,
            };
            let request_json = serde_json::to_string(&request).map_err(|e| {
                EmbeddingError::InvalidResponse(format!("failed to serialize request: {}", e))
            })?;

            let response_text = self.make_request_with_retry(cancel, || {
                self.agent
                    .post(url.as_str())
                    .header("Content-Type", "application/json")
                    .send(&request_json)
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })?;

            let response: EmbedResponse = serde_json::from_str(&response_text).map_err(|e| {
                EmbeddingError::InvalidResponse(format!("failed to parse embed response: {}", e))
            })?;

            if response.embeddings.len() != batch.len() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "Mismatch between request and response counts: {} vs {}",
                    batch.len(),
                    response.embeddings.len()
                )));
            }

            for embedding in &response.embeddings {
                check_dimension(self.embedding_dimension, embedding)?;
            }
            results.extend(response.embeddings);
        }

        debug!("Generated {} embeddings total", results.len());
        Ok(results)
    }

    /// Run a single non-streaming generation, blocking the current thread
    fn generate_blocking(
        &self,
        request: &GenerationRequest,
        cancel: &CancelSignal,
    ) -> Result<String, GenerationError> {
        let url = self
            .base_url
            .join("/api/generate")
            .map_err(|e| GenerationError::Request(format!("bad generate URL: {}", e)))?;

        let body = GenerateRequest {
            model: &self.generation_model,
            system: &request.system,
            prompt: &request.prompt,
            stream: false,
            options: GenerateOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };
        let request_json = serde_json::to_string(&body)
            .map_err(|e| GenerationError::Request(format!("failed to serialize request: {}", e)))?;

        let response_text = self.make_request_with_retry(cancel, || {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&request_json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let response: GenerateResponse = serde_json::from_str(&response_text).map_err(|e| {
            GenerationError::Request(format!("failed to parse generate response: {}", e))
        })?;

        let answer = response.response.trim();
        if answer.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(answer.to_string())
    }

    /// Run `request_fn` with retries; stops without another attempt once
    /// `cancel` fires
    fn make_request_with_retry<F>(
        &self,
        cancel: &CancelSignal,
        mut request_fn: F,
    ) -> Result<String, RequestFailure>
    where
        F: FnMut() -> Result<String, ureq::Error>,
    {
        let mut last_error = None;
        let attempts = self.retry_attempts.max(1);

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                debug!("Request to {} cancelled before attempt {}", self.base_url, attempt);
                return Err(RequestFailure::Cancelled);
            }
            debug!("HTTP request attempt {}/{}", attempt, attempts);

            match request_fn() {
                Ok(response_text) => {
                    debug!("Request succeeded on attempt {}", attempt);
                    return Ok(response_text);
                }
                Err(error) => {
                    let failure = match &error {
                        ureq::Error::StatusCode(status) => {
                            let status = *status;
                            if status >= 500 || status == 429 {
                                warn!(
                                    "Server error (status {}), attempt {}/{}",
                                    status, attempt, attempts
                                );
                                RequestFailure::Status(status)
                            } else {
                                warn!("Client error (status {}), not retrying", status);
                                return Err(RequestFailure::Status(status));
                            }
                        }
                        ureq::Error::Timeout(_) => {
                            warn!("Request timed out, attempt {}/{}", attempt, attempts);
                            RequestFailure::Timeout
                        }
                        ureq::Error::ConnectionFailed
                        | ureq::Error::HostNotFound
                        | ureq::Error::Io(_) => {
                            warn!(
                                "Transport error: {}, attempt {}/{}",
                                error, attempt, attempts
                            );
                            RequestFailure::Transport(error.to_string())
                        }
                        _ => {
                            warn!("Non-retryable error: {}", error);
                            return Err(RequestFailure::Other(error.to_string()));
                        }
                    };

                    last_error = Some(failure);

                    // Wait before retry (exponential backoff)
                    if attempt < attempts {
                        let delay = self
                            .retry_delay
                            .saturating_mul(EXPONENTIAL_BACKOFF_BASE.saturating_pow(attempt - 1));
                        debug!("Waiting {:?} before retry", delay);
                        if !cancel.sleep(delay) {
                            debug!("Request to {} cancelled during backoff", self.base_url);
                            return Err(RequestFailure::Cancelled);
                        }
                    }
                }
            }
        }

        error!("All retry attempts failed for request to {}", self.base_url);

        Err(last_error
            .unwrap_or_else(|| RequestFailure::Other("Request failed after retries".to_string())))
    }
}

/// Move a blocking call onto tokio's blocking pool.
///
/// If the returned future is dropped before the call finishes, the call
/// sees its [`CancelSignal`] fire and makes no further attempts.
async fn run_blocking<T, E, F>(client: &OllamaClient, call: F) -> Result<T, E>
where
    F: FnOnce(&OllamaClient, &CancelSignal) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<RequestFailure> + Send + 'static,
{
    let client = client.clone();
    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
    let result = tokio::task::spawn_blocking(move || call(&client, &CancelSignal(Some(cancel_rx))))
        .await
        .map_err(|e| E::from(RequestFailure::Other(format!("blocking task failed: {}", e))));
    drop(cancel_tx);
    result?
}

#[async_trait]
impl EmbeddingProvider for OllamaClient {
    #[inline]
    fn dimension(&self) -> usize {
        self.embedding_dimension
    }

    #[inline]
    fn fingerprint(&self) -> ProviderFingerprint {
        ProviderFingerprint::new(
            PROVIDER_NAME,
            self.embedding_model.as_str(),
            self.embedding_dimension,
        )
        .with_option("base_url", self.base_url.as_str())
    }

    #[inline]
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        debug!("Generating embedding for text (length: {})", text.len());
        let texts = vec![text.to_string()];
        let mut embeddings =
            run_blocking(self, move |client, cancel| client.embed_blocking(&texts, cancel))
                .await?;
        embeddings
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned".to_string()))
    }

    #[inline]
    async fn generate_batch_embeddings(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        debug!("Generating embeddings for {} texts", texts.len());
        let texts = texts.to_vec();
        run_blocking(self, move |client, cancel| client.embed_blocking(&texts, cancel)).await
    }
}

#[async_trait]
impl GenerationModel for OllamaClient {
    #[inline]
    fn model_name(&self) -> &str {
        &self.generation_model
    }

    #[inline]
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        debug!(
            "Generating answer with {} (prompt length: {})",
            self.generation_model,
            request.prompt.len()
        );
        let request = request.clone();
        run_blocking(self, move |client, cancel| {
            client.generate_blocking(&request, cancel)
        }).await
    }
}
