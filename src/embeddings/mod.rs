//! Embeddings for published content.
//!
//! An [`EmbeddingProvider`] turns text into vectors. [`StoredEmbeddings`]
//! pairs a provider with an [`EmbeddingStore`] so published posts can be
//! remembered and later compared against new candidates.

mod openai;

pub use openai::OpenAiEmbeddings;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::db::{EmbeddingRecord, EmbeddingStore};
use crate::error::EmbeddingError;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Vector length this provider produces.
    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Embedding operations the orchestrator depends on.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Stored embeddings of `agent_id` nearest to `vector`, closest first.
    async fn nearest(
        &self,
        agent_id: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<EmbeddingRecord>, EmbeddingError>;

    /// Embed `text` and store it under `item_id`.
    async fn remember(
        &self,
        agent_id: &str,
        item_id: &str,
        text: &str,
    ) -> Result<(), EmbeddingError>;
}

/// [`EmbeddingService`] backed by a provider and the database.
pub struct StoredEmbeddings {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn EmbeddingStore>,
}

impl StoredEmbeddings {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, store: Arc<dyn EmbeddingStore>) -> Self {
        Self { provider, store }
    }
}

#[async_trait]
impl EmbeddingService for StoredEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let vector = self.provider.embed(text).await?;
        let expected = self.provider.dimension();
        if vector.len() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                got: vector.len(),
            });
        }
        Ok(vector)
    }

    async fn nearest(
        &self,
        agent_id: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<EmbeddingRecord>, EmbeddingError> {
        Ok(self.store.nearest_embeddings(agent_id, vector, k).await?)
    }

    async fn remember(
        &self,
        agent_id: &str,
        item_id: &str,
        text: &str,
    ) -> Result<(), EmbeddingError> {
        let vector = self.embed(text).await?;
        self.store
            .save_embedding(&EmbeddingRecord {
                agent_id: agent_id.to_string(),
                item_id: item_id.to_string(),
                text: text.to_string(),
                vector,
                created_at: Utc::now(),
            })
            .await?;
        tracing::debug!(
            agent = agent_id,
            item_id,
            model = self.provider.model_name(),
            "Stored embedding"
        );
        Ok(())
    }
}

/// Cosine similarity in `[-1, 1]`. Zero-length or zero-norm input yields 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
