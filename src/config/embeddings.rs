use secrecy::SecretString;

use crate::config::LlmConfig;
use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Embeddings provider configuration.
///
/// Defaults to the same OpenAI-compatible endpoint and key as generation.
#[derive(Debug, Clone)]
pub struct EmbeddingsConfig {
    /// When disabled, the novelty check accepts every candidate.
    pub enabled: bool,
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    /// Inferred from the model name when not set explicitly.
    pub dimension: usize,
}

/// Infer the embedding dimension from a well-known model name.
///
/// Falls back to 1536 for unknown models.
fn default_dimension_for_model(model: &str) -> usize {
    match model {
        "text-embedding-3-small" => 1536,
        "text-embedding-3-large" => 3072,
        "text-embedding-ada-002" => 1536,
        "nomic-embed-text" => 768,
        "all-minilm" | "all-MiniLM-L6-v2" => 384,
        _ => 1536,
    }
}

impl EmbeddingsConfig {
    pub(crate) fn resolve(llm: &LlmConfig) -> Result<Self, ConfigError> {
        let model = parse_string_env("EMBEDDING_MODEL", "text-embedding-3-small")?;
        let dimension =
            parse_optional_env("EMBEDDING_DIMENSION", default_dimension_for_model(&model))?;

        Ok(Self {
            enabled: parse_bool_env("EMBEDDING_ENABLED", true)?,
            base_url: optional_env("EMBEDDING_PROVIDER_URL")?
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| llm.base_url.clone()),
            api_key: optional_env("EMBEDDING_API_KEY")?
                .map(SecretString::from)
                .unwrap_or_else(|| llm.api_key.clone()),
            model,
            dimension,
        })
    }
}
