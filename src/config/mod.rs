// Configuration management module
// TOML-backed settings for every stage of the pipeline

pub mod settings;

pub use settings::{Config, ConfigError, OllamaConfig};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}
