//! Novelty guard: keep regenerating until the text is unlike recent posts.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::embeddings::{EmbeddingService, cosine_similarity};
use crate::error::LlmError;
use crate::llm::Generation;

/// Decides whether a candidate repeats something already published.
#[async_trait]
pub trait SimilarityCheck: Send + Sync {
    async fn is_too_similar(&self, agent_id: &str, text: &str) -> bool;
}

/// Compares a candidate's embedding against the agent's nearest stored posts.
pub struct EmbeddingSimilarity {
    embeddings: Arc<dyn EmbeddingService>,
    top_k: usize,
    threshold: f32,
}

impl EmbeddingSimilarity {
    pub fn new(embeddings: Arc<dyn EmbeddingService>, top_k: usize, threshold: f32) -> Self {
        Self {
            embeddings,
            top_k,
            threshold,
        }
    }
}

#[async_trait]
impl SimilarityCheck for EmbeddingSimilarity {
    async fn is_too_similar(&self, agent_id: &str, text: &str) -> bool {
        let vector = match self.embeddings.embed(text).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(agent = agent_id, error = %e, "Embedding failed, skipping similarity check");
                return false;
            }
        };
        let nearest = match self.embeddings.nearest(agent_id, &vector, self.top_k).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(agent = agent_id, error = %e, "Similarity lookup failed");
                return false;
            }
        };
        let best = nearest
            .iter()
            .map(|r| cosine_similarity(&vector, &r.vector))
            .fold(f32::MIN, f32::max);
        if best >= self.threshold {
            tracing::info!(agent = agent_id, similarity = best, "Candidate too similar to a recent post");
            return true;
        }
        false
    }
}

/// Accepts everything. Used when embeddings are disabled.
pub struct AcceptAll;

#[async_trait]
impl SimilarityCheck for AcceptAll {
    async fn is_too_similar(&self, _agent_id: &str, _text: &str) -> bool {
        false
    }
}

/// Bounded regenerate-until-novel loop.
#[derive(Debug, Clone, Copy)]
pub struct NoveltyGuard {
    max_attempts: u32,
}

impl NoveltyGuard {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Generate up to `max_attempts` candidates and return the first one
    /// the checker accepts, or `None` when every attempt was too similar.
    /// Generation errors end the loop immediately.
    pub async fn accept<F, Fut>(
        &self,
        agent_id: &str,
        mut generate: F,
        checker: &dyn SimilarityCheck,
    ) -> Result<Option<Generation>, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Generation, LlmError>>,
    {
        for attempt in 1..=self.max_attempts {
            let candidate = generate().await?;
            if !checker.is_too_similar(agent_id, &candidate.content).await {
                return Ok(Some(candidate));
            }
            tracing::debug!(
                agent = agent_id,
                attempt,
                max = self.max_attempts,
                "Rejected repetitive candidate"
            );
        }
        tracing::warn!(
            agent = agent_id,
            attempts = self.max_attempts,
            "No novel content generated"
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::embeddings::StoredEmbeddings;
    use crate::testing::{HashEmbeddings, StubSimilarity, test_db};

    fn generation(content: &str) -> Generation {
        Generation {
            prompt: "p".to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let checker = StubSimilarity::always(true);
        let result = NoveltyGuard::new(3)
            .accept(
                "ava",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, LlmError>(generation("same again")) }
                },
                &checker,
            )
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(checker.checks(), 3);
    }

    #[tokio::test]
    async fn returns_first_novel_candidate() {
        let calls = AtomicU32::new(0);
        let checker = StubSimilarity::sequence(vec![true, false]);
        let result = NoveltyGuard::new(3)
            .accept(
                "ava",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<_, LlmError>(generation(&format!("candidate {n}"))) }
                },
                &checker,
            )
            .await
            .unwrap();
        assert_eq!(result.unwrap().content, "candidate 1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn generation_error_propagates() {
        let result = NoveltyGuard::new(3)
            .accept(
                "ava",
                || async {
                    Err::<Generation, _>(LlmError::RequestFailed {
                        provider: "stub".to_string(),
                        reason: "down".to_string(),
                    })
                },
                &AcceptAll,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn embedding_similarity_flags_repeats() {
        let (db, _dir) = test_db().await;
        let embeddings = Arc::new(StoredEmbeddings::new(Arc::new(HashEmbeddings::new(32)), db));
        embeddings
            .remember("ava", "1", "gm frens the chain is alive")
            .await
            .unwrap();

        let checker = EmbeddingSimilarity::new(embeddings, 5, 0.5);
        assert!(checker.is_too_similar("ava", "gm frens the chain is alive").await);
        assert!(!checker.is_too_similar("bob", "gm frens the chain is alive").await);
    }

    #[tokio::test]
    async fn embedding_failure_is_not_similar() {
        let (db, _dir) = test_db().await;
        let embeddings = Arc::new(StoredEmbeddings::new(Arc::new(HashEmbeddings::failing()), db));
        let checker = EmbeddingSimilarity::new(embeddings, 5, 0.5);
        assert!(!checker.is_too_similar("ava", "anything").await);
    }
}
