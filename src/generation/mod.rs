// Answer generation module
// Pure grounded-prompt construction, separated from the single model call that consumes it


use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::retry::{CallBudget, RetryPolicy};

/// Exact reply the model must give when the context does not contain the answer
pub const INSUFFICIENT_INFORMATION_ANSWER: &str =
    "I don't have enough information to answer that question.";

const GENERATION_ATTEMPTS: u32 = 2;
const GENERATION_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Generation timed out")]
    Timeout,
    #[error("Generation request rejected: {0}")]
    Rejected(String),
    #[error("Generation request failed: {0}")]
    Request(String),
    #[error("Model returned an empty answer")]
    EmptyResponse,
}

/// One call to a text generation model
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A text generation backend
#[async_trait]
pub trait GenerationModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}

/// System instruction and user prompt for one grounded question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundedPrompt {
    pub system: String,
    pub prompt: String,
}

/// Builds prompts that confine the model to the supplied context
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    #[inline]
    pub fn system_instruction() -> String {
        format!(
            "You are a question answering assistant. Answer using only facts stated in the \
             provided context and never rely on outside knowledge. Cite the [docN] label of \
             every context block you use. If the context does not contain the answer, reply \
             exactly: \"{}\"",
            INSUFFICIENT_INFORMATION_ANSWER
        )
    }

    #[inline]
    pub fn build(question: &str, context: &str) -> GroundedPrompt {
        GroundedPrompt {
            system: Self::system_instruction(),
            prompt: format!("Context:\n{}\n\nQuestion: {}\n\nAnswer:", context, question),
        }
    }
}

/// Turns a question and its assembled context into an answer with one model call
#[derive(Clone)]
pub struct AnswerSynthesizer {
    model: Arc<dyn GenerationModel>,
    retry: RetryPolicy,
}

impl AnswerSynthesizer {
    #[inline]
    pub fn new(model: Arc<dyn GenerationModel>) -> Self {
        Self {
            model,
            retry: RetryPolicy::new(GENERATION_ATTEMPTS, GENERATION_RETRY_DELAY),
        }
    }

    #[inline]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Generate an answer grounded in `context`.
    ///
    /// A failed call is retried once while the query deadline allows it.
    /// Each attempt is bounded by the budget's per-call timeout.
    #[inline]
    pub async fn synthesize(
        &self,
        question: &str,
        context: &str,
        temperature: f32,
        max_tokens: u32,
        budget: &CallBudget,
    ) -> Result<String, GenerationError> {
        let grounded = PromptBuilder::build(question, context);
        let request = GenerationRequest {
            system: grounded.system,
            prompt: grounded.prompt,
            temperature,
            max_tokens,
        };
        debug!(
            "Synthesizing answer with {} (prompt length: {})",
            self.model.model_name(),
            request.prompt.len()
        );

        let model = &self.model;
        let request = &request;
        let result = self
            .retry
            .run(
                "generation",
                |_| !budget.query_expired(),
                move || async move {
                    match budget.run(model.generate(request)).await {
                        Ok(Ok(answer)) if answer.trim().is_empty() => {
                            Err(GenerationError::EmptyResponse)
                        }
                        Ok(result) => result,
                        Err(_) => Err(GenerationError::Timeout),
                    }
                },
            )
            .await;

        if let Err(e) = &result {
            warn!("Answer generation failed: {}", e);
        }
        result
    }
}
