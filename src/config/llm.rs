use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{parse_optional_env, parse_secs_env, parse_string_env, required_env};
use crate::error::ConfigError;

/// OpenAI-compatible LLM provider configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: SecretString,
    /// Model used when a character does not name one.
    pub default_model: String,
    /// Retries on transient HTTP failures.
    pub max_retries: u32,
    pub request_timeout: Duration,
    /// Posts longer than this are regenerated.
    pub max_post_length: usize,
    /// Refusals tolerated before the character's fallback model is tried.
    pub refusal_threshold: u32,
}

impl LlmConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: required_env("LLM_PROVIDER_URL")?
                .trim_end_matches('/')
                .to_string(),
            api_key: SecretString::from(required_env("LLM_PROVIDER_API_KEY")?),
            default_model: parse_string_env("LLM_MODEL", "gpt-4o-mini")?,
            max_retries: parse_optional_env("LLM_MAX_RETRIES", 3)?,
            request_timeout: parse_secs_env("LLM_REQUEST_TIMEOUT_SECS", Duration::from_secs(120))?,
            max_post_length: parse_optional_env("LLM_MAX_POST_LENGTH", 280)?,
            refusal_threshold: parse_optional_env("LLM_REFUSAL_THRESHOLD", 3)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::ENV_MUTEX;

    #[test]
    fn missing_provider_url_is_fatal() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::remove_var("LLM_PROVIDER_URL");
            std::env::set_var("LLM_PROVIDER_API_KEY", "sk-test");
        }
        let err = LlmConfig::resolve().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(k) if k == "LLM_PROVIDER_URL"));
        unsafe { std::env::remove_var("LLM_PROVIDER_API_KEY") };
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("LLM_PROVIDER_URL", "https://llm.local/v1/");
            std::env::set_var("LLM_PROVIDER_API_KEY", "sk-test");
        }
        let config = LlmConfig::resolve().unwrap();
        assert_eq!(config.base_url, "https://llm.local/v1");
        assert_eq!(config.max_post_length, 280);
        assert_eq!(config.refusal_threshold, 3);
        unsafe {
            std::env::remove_var("LLM_PROVIDER_URL");
            std::env::remove_var("LLM_PROVIDER_API_KEY");
        }
    }
}
