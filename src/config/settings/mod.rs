
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::conversation::ConversationConfig;
use crate::embeddings::chunking::{ChunkingConfig, ChunkingError};
use crate::embeddings::ollama::DEFAULT_EMBEDDING_DIMENSION;
use crate::index::IndexConfig;
use crate::indexer::IngestionConfig;
use crate::retrieval::RetrievalConfig;

const APP_DIR_NAME: &str = "docs-rag";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub embedding_model: String,
    pub generation_model: String,
    pub batch_size: u32,
    pub embedding_dimension: u32,
    pub timeout_seconds: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            embedding_model: "nomic-embed-text:latest".to_string(),
            generation_model: "llama3.2:latest".to_string(),
            batch_size: 16,
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid embedding dimension: {0} (must be between 8 and 8192)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid request timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidRequestTimeout(u64),
    #[error("Invalid chunking settings: {0}")]
    Chunking(#[from] ChunkingError),
    #[error("Invalid table name: '{0}' (must be non-empty alphanumeric or underscore)")]
    InvalidTableName(String),
    #[error("Invalid ingestion batch size: {0} (must be between 1 and 1000)")]
    InvalidIngestionBatchSize(usize),
    #[error("Invalid max concurrency: {0} (must be between 1 and 64)")]
    InvalidMaxConcurrency(usize),
    #[error("Invalid retry attempts: {0} (must be between 1 and 10)")]
    InvalidRetryAttempts(u32),
    #[error("Invalid top_k: {0} (must be between 1 and 100)")]
    InvalidTopK(usize),
    #[error("Invalid max context size: {0} (must be at least 100 characters)")]
    InvalidMaxContextChars(usize),
    #[error("Invalid temperature: {0} (must be between 0.0 and 2.0)")]
    InvalidTemperature(f32),
    #[error("Invalid max tokens: {0} (must be between 1 and 32768)")]
    InvalidMaxTokens(u32),
    #[error("Per-call timeout ({0}s) must not exceed the query timeout ({1}s)")]
    PerCallTimeoutTooLarge(u64, u64),
    #[error("Invalid max turns: {0} (must be between 1 and 256)")]
    InvalidMaxTurns(usize),
    #[error("Rewrite turns ({0}) must not exceed max turns ({1})")]
    RewriteTurnsTooLarge(usize, usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Default configuration directory, `<config dir>/docs-rag`
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR_NAME))
            .or_else(|| dirs::home_dir().map(|home| home.join(format!(".{}", APP_DIR_NAME))))
            .ok_or(ConfigError::DirectoryError)
    }

    /// Load `config.toml` from `config_dir`, falling back to defaults when it does not exist
    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            debug!(
                "No config file at {}, using defaults",
                config_path.display()
            );
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Get the base directory for the application
    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ollama.validate()?;
        self.chunking.validate()?;
        self.validate_index_config()?;
        self.validate_ingestion_config()?;
        self.validate_retrieval_config()?;
        self.validate_conversation_config()?;
        Ok(())
    }

    fn validate_index_config(&self) -> Result<(), ConfigError> {
        let name = &self.index.table_name;
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ConfigError::InvalidTableName(name.clone()));
        }
        Ok(())
    }

    fn validate_ingestion_config(&self) -> Result<(), ConfigError> {
        let config = &self.ingestion;

        if !(1..=1000).contains(&config.batch_size) {
            return Err(ConfigError::InvalidIngestionBatchSize(config.batch_size));
        }

        if !(1..=64).contains(&config.max_concurrency) {
            return Err(ConfigError::InvalidMaxConcurrency(config.max_concurrency));
        }

        if !(1..=10).contains(&config.embed_retry_attempts) {
            return Err(ConfigError::InvalidRetryAttempts(
                config.embed_retry_attempts,
            ));
        }

        Ok(())
    }

    fn validate_retrieval_config(&self) -> Result<(), ConfigError> {
        let config = &self.retrieval;

        if !(1..=100).contains(&config.top_k) {
            return Err(ConfigError::InvalidTopK(config.top_k));
        }

        if config.max_context_chars < 100 {
            return Err(ConfigError::InvalidMaxContextChars(config.max_context_chars));
        }

        if !(0.0..=2.0).contains(&config.temperature) {
            return Err(ConfigError::InvalidTemperature(config.temperature));
        }

        if !(1..=32768).contains(&config.max_tokens) {
            return Err(ConfigError::InvalidMaxTokens(config.max_tokens));
        }

        if !(1..=600).contains(&config.per_call_timeout_seconds) {
            return Err(ConfigError::InvalidRequestTimeout(
                config.per_call_timeout_seconds,
            ));
        }

        if !(1..=600).contains(&config.query_timeout_seconds) {
            return Err(ConfigError::InvalidRequestTimeout(
                config.query_timeout_seconds,
            ));
        }

        if config.per_call_timeout_seconds > config.query_timeout_seconds {
            return Err(ConfigError::PerCallTimeoutTooLarge(
                config.per_call_timeout_seconds,
                config.query_timeout_seconds,
            ));
        }

        if !(1..=10).contains(&config.index_retry_attempts) {
            return Err(ConfigError::InvalidRetryAttempts(
                config.index_retry_attempts,
            ));
        }

        Ok(())
    }

    fn validate_conversation_config(&self) -> Result<(), ConfigError> {
        let config = &self.conversation;

        if !(1..=256).contains(&config.max_turns) {
            return Err(ConfigError::InvalidMaxTurns(config.max_turns));
        }

        if config.rewrite_turns > config.max_turns {
            return Err(ConfigError::RewriteTurnsTooLarge(
                config.rewrite_turns,
                config.max_turns,
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Get the path for the vector database directory
    #[inline]
    pub fn vector_database_path(&self) -> PathBuf {
        self.get_base_dir().join("vectors")
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.ollama.ollama_url()
    }
}

impl OllamaConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        self.ollama_url()?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        for model in [&self.embedding_model, &self.generation_model] {
            if model.trim().is_empty() {
                return Err(ConfigError::InvalidModel(model.clone()));
            }
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(8..=8192).contains(&self.embedding_dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.embedding_dimension,
            ));
        }

        if !(1..=600).contains(&self.timeout_seconds) {
            return Err(ConfigError::InvalidRequestTimeout(self.timeout_seconds));
        }

        Ok(())
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }
}
