//! Configuration for the persona runtime.
//!
//! Settings are loaded with priority: env var > default. A `.env` file in
//! the working directory is loaded via dotenvy before anything is read.
//! Character definitions live in a separate JSON file (see
//! [`crate::character`]); only its path is configured here.

mod database;
mod embeddings;
pub(crate) mod helpers;
mod llm;
mod runtime;

use std::path::PathBuf;

pub use self::database::DatabaseConfig;
pub use self::embeddings::EmbeddingsConfig;
pub use self::llm::LlmConfig;
pub use self::runtime::RuntimeConfig;

use crate::config::helpers::parse_string_env;
use crate::error::ConfigError;

/// Main configuration for the runtime.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub embeddings: EmbeddingsConfig,
    pub runtime: RuntimeConfig,
    /// Path to the characters JSON file.
    pub characters_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// `LLM_PROVIDER_URL` and `LLM_PROVIDER_API_KEY` are required; every
    /// other value has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let llm = LlmConfig::resolve()?;
        Ok(Self {
            database: DatabaseConfig::resolve()?,
            embeddings: EmbeddingsConfig::resolve(&llm)?,
            llm,
            runtime: RuntimeConfig::resolve()?,
            characters_path: PathBuf::from(parse_string_env(
                "CHARACTERS_PATH",
                "characters.json",
            )?),
        })
    }
}

/// Load only the `.env` file and the characters path.
///
/// Used by CLI commands that inspect characters without talking to the
/// LLM provider.
pub fn characters_path_from_env() -> Result<PathBuf, ConfigError> {
    let _ = dotenvy::dotenv();
    Ok(PathBuf::from(parse_string_env(
        "CHARACTERS_PATH",
        "characters.json",
    )?))
}
