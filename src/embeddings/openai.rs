use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingsConfig;
use crate::embeddings::EmbeddingProvider;
use crate::error::EmbeddingError;
use crate::llm::retry::{HttpFailure, post_json_with_retry};

const MAX_RETRIES: u32 = 2;

/// Provider for any `/embeddings` endpoint speaking the OpenAI format.
pub struct OpenAiEmbeddings {
    client: Client,
    config: EmbeddingsConfig,
}

impl OpenAiEmbeddings {
    pub fn new(config: EmbeddingsConfig) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { client, config })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/embeddings", self.config.base_url);
        let body = EmbeddingRequest {
            model: &self.config.model,
            input: text,
        };
        let raw = post_json_with_retry(
            &self.client,
            &url,
            &self.config.api_key,
            &body,
            MAX_RETRIES,
            "embeddings",
        )
        .await
        .map_err(|failure| EmbeddingError::RequestFailed {
            reason: match failure {
                HttpFailure::Transport(reason) => reason,
                HttpFailure::Unauthorized => "unauthorized".to_string(),
                HttpFailure::RateLimited => "rate limited".to_string(),
                HttpFailure::Status { status, body } => format!("HTTP {status}: {body}"),
            },
        })?;

        parse_embedding(&raw)
    }
}

fn parse_embedding(raw: &str) -> Result<Vec<f32>, EmbeddingError> {
    let parsed: EmbeddingResponse =
        serde_json::from_str(raw).map_err(|e| EmbeddingError::InvalidResponse {
            reason: e.to_string(),
        })?;
    parsed
        .data
        .into_iter()
        .next()
        .map(|d| d.embedding)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EmbeddingError::InvalidResponse {
            reason: "response contained no embedding".to_string(),
        })
}
