//! ItemStore and InteractionStore implementations for LibSqlBackend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params;

use super::{ITEM_COLUMNS, LibSqlBackend, fmt_ts, get_i64, get_text, opt_text, row_to_item, sql_limit};
use crate::db::{InteractionStore, ItemStore, validate_item};
use crate::error::DatabaseError;
use crate::platform::Item;

impl LibSqlBackend {
    async fn query_items(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Item>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            items.push(row_to_item(&row));
        }
        Ok(items)
    }
}

#[async_trait]
impl ItemStore for LibSqlBackend {
    async fn save_item(&self, agent_id: &str, item: &Item) -> Result<(), DatabaseError> {
        validate_item(agent_id, item)?;
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO items (
                agent_id, id, author_id, author_handle, text, conversation_id,
                created_at, in_reply_to_item_id, in_reply_to_user_id, in_reply_to_handle
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                agent_id,
                item.id.as_str(),
                item.author_id.as_str(),
                item.author_handle.as_str(),
                item.text.as_str(),
                opt_text(item.conversation_id.as_deref()),
                fmt_ts(&item.created_at),
                opt_text(item.in_reply_to_item_id.as_deref()),
                opt_text(item.in_reply_to_user_id.as_deref()),
                opt_text(item.in_reply_to_handle.as_deref()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
        tracing::debug!(agent = agent_id, item_id = %item.id, "Saved item");
        Ok(())
    }

    async fn get_item(&self, agent_id: &str, id: &str) -> Result<Option<Item>, DatabaseError> {
        let items = self
            .query_items(
                &format!(
                    "SELECT {} FROM items WHERE agent_id = ?1 AND id = ?2",
                    ITEM_COLUMNS
                ),
                params![agent_id, id],
            )
            .await?;
        Ok(items.into_iter().next())
    }

    async fn list_history(
        &self,
        agent_id: &str,
        author_id: &str,
        limit: usize,
    ) -> Result<Vec<Item>, DatabaseError> {
        self.query_items(
            &format!(
                "SELECT {} FROM items WHERE agent_id = ?1 AND author_id = ?2 \
                 ORDER BY created_at DESC LIMIT ?3",
                ITEM_COLUMNS
            ),
            params![agent_id, author_id, sql_limit(limit)],
        )
        .await
    }

    async fn list_conversation(
        &self,
        agent_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Item>, DatabaseError> {
        self.query_items(
            &format!(
                "SELECT {} FROM items WHERE agent_id = ?1 AND conversation_id = ?2 \
                 ORDER BY created_at DESC LIMIT ?3",
                ITEM_COLUMNS
            ),
            params![agent_id, conversation_id, sql_limit(limit)],
        )
        .await
    }

    async fn save_prompt(&self, item_id: &str, prompt: &str) -> Result<(), DatabaseError> {
        if item_id.is_empty() || prompt.is_empty() {
            return Err(DatabaseError::MissingFields {
                entity: "prompt".to_string(),
                fields: [("item_id", item_id), ("prompt", prompt)]
                    .iter()
                    .filter(|(_, v)| v.is_empty())
                    .map(|(k, _)| *k)
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO prompts (item_id, prompt, created_at) VALUES (?1, ?2, ?3)",
            params![item_id, prompt, fmt_ts(&Utc::now())],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn get_prompt(&self, item_id: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT prompt FROM prompts WHERE item_id = ?1 ORDER BY id DESC LIMIT 1",
                params![item_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(get_text(&row, 0))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl InteractionStore for LibSqlBackend {
    async fn count_interactions(
        &self,
        agent_id: &str,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM items \
                 WHERE agent_id = ?1 AND in_reply_to_user_id = ?2 AND created_at > ?3",
                params![agent_id, user_id, fmt_ts(&since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let count = match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => get_i64(&row, 0),
            None => 0,
        };
        Ok(count.max(0) as u64)
    }
}
