//! Database abstraction layer.
//!
//! Provides a backend-agnostic `Database` trait that unifies all persistence
//! operations. The only backend is libSQL (embedded SQLite), behind the
//! default `libsql` feature.

#[cfg(feature = "libsql")]
pub mod libsql;

#[cfg(feature = "libsql")]
pub mod libsql_migrations;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::platform::Item;

/// Open the configured database, run migrations, and return it.
#[cfg(feature = "libsql")]
pub async fn connect_from_config(
    config: &crate::config::DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    let backend = libsql::LibSqlBackend::new_local(&config.path).await?;
    backend.run_migrations().await?;
    tracing::info!(path = %config.path.display(), "Database ready");
    Ok(Arc::new(backend))
}

/// Check the fields an item must carry before it can be stored.
///
/// Returns `DatabaseError::MissingFields` naming every empty field.
pub fn validate_item(agent_id: &str, item: &Item) -> Result<(), DatabaseError> {
    let checks = [
        ("id", item.id.is_empty()),
        ("author_id", item.author_id.is_empty()),
        ("author_handle", item.author_handle.is_empty()),
        ("text", item.text.is_empty()),
        (
            "conversation_id",
            item.conversation_id.as_deref().is_none_or(str::is_empty),
        ),
        ("agent_id", agent_id.is_empty()),
    ];
    let missing: Vec<&str> = checks
        .iter()
        .filter(|(_, missing)| *missing)
        .map(|(name, _)| *name)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DatabaseError::MissingFields {
            entity: "item".to_string(),
            fields: missing.join(", "),
        })
    }
}

/// A chat turn row (user message or bot response).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Assigned by the store; `None` before insertion.
    pub id: Option<i64>,
    pub agent_id: String,
    pub platform: String,
    pub channel_id: Option<String>,
    pub message_id: Option<String>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub session_id: Option<String>,
    pub content: String,
    pub message_type: String,
    pub metadata: Option<serde_json::Value>,
    pub is_bot_response: bool,
    pub prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A stored embedding of published text.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub agent_id: String,
    pub item_id: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

// ==================== Sub-traits ====================
//
// Each sub-trait groups related persistence methods. Leaf consumers (the
// throttle, the novelty checker) depend on the narrow trait; the runtime
// holds the combined `Database`.

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Store an item seen or published by `agent_id`. Re-saving the same
    /// id for the same agent replaces the row.
    async fn save_item(&self, agent_id: &str, item: &Item) -> Result<(), DatabaseError>;
    async fn get_item(&self, agent_id: &str, id: &str) -> Result<Option<Item>, DatabaseError>;
    /// Most recent items authored by `author_id`, newest first.
    async fn list_history(
        &self,
        agent_id: &str,
        author_id: &str,
        limit: usize,
    ) -> Result<Vec<Item>, DatabaseError>;
    /// Most recent items in a thread, newest first.
    async fn list_conversation(
        &self,
        agent_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Item>, DatabaseError>;
    async fn save_prompt(&self, item_id: &str, prompt: &str) -> Result<(), DatabaseError>;
    async fn get_prompt(&self, item_id: &str) -> Result<Option<String>, DatabaseError>;
}

#[async_trait]
pub trait InteractionStore: Send + Sync {
    /// Items stored for `agent_id` that reply to `user_id` and were created
    /// strictly after `since`.
    async fn count_interactions(
        &self,
        agent_id: &str,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn save_chat_message(&self, message: &ChatMessage) -> Result<i64, DatabaseError>;
    /// Last `limit` messages of a channel, oldest first.
    async fn list_chat_messages(
        &self,
        agent_id: &str,
        platform: &str,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, DatabaseError>;
}

#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    async fn save_embedding(&self, record: &EmbeddingRecord) -> Result<(), DatabaseError>;
    /// The `k` stored embeddings of `agent_id` closest to `vector` by L2
    /// distance, closest first. Vectors of a different dimension are skipped.
    async fn nearest_embeddings(
        &self,
        agent_id: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<EmbeddingRecord>, DatabaseError>;
}

/// Backend-agnostic database supertrait.
#[async_trait]
pub trait Database: ItemStore + InteractionStore + ChatStore + EmbeddingStore + Send + Sync {
    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}
