//! ChatStore implementation for LibSqlBackend.

use async_trait::async_trait;
use libsql::params;

use super::{CHAT_COLUMNS, LibSqlBackend, fmt_ts, opt_text, row_to_chat_message, sql_limit};
use crate::db::{ChatMessage, ChatStore};
use crate::error::DatabaseError;

#[async_trait]
impl ChatStore for LibSqlBackend {
    async fn save_chat_message(&self, message: &ChatMessage) -> Result<i64, DatabaseError> {
        if message.content.is_empty() || message.platform.is_empty() {
            return Err(DatabaseError::MissingFields {
                entity: "chat message".to_string(),
                fields: "platform, content".to_string(),
            });
        }
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::Value::to_string);

        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO chat_messages (
                agent_id, platform, platform_channel_id, platform_message_id,
                platform_user_id, username, session_id, message_content,
                message_type, metadata, is_bot_response, prompt, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                message.agent_id.as_str(),
                message.platform.as_str(),
                opt_text(message.channel_id.as_deref()),
                opt_text(message.message_id.as_deref()),
                opt_text(message.user_id.as_deref()),
                opt_text(message.username.as_deref()),
                opt_text(message.session_id.as_deref()),
                message.content.as_str(),
                message.message_type.as_str(),
                opt_text(metadata.as_deref()),
                message.is_bot_response as i64,
                opt_text(message.prompt.as_deref()),
                fmt_ts(&message.created_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

        Ok(conn.last_insert_rowid())
    }

    async fn list_chat_messages(
        &self,
        agent_id: &str,
        platform: &str,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM chat_messages \
                     WHERE agent_id = ?1 AND platform = ?2 AND platform_channel_id = ?3 \
                     ORDER BY id DESC LIMIT ?4",
                    CHAT_COLUMNS
                ),
                params![agent_id, platform, channel_id, sql_limit(limit)],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            messages.push(row_to_chat_message(&row));
        }
        messages.reverse();
        Ok(messages)
    }
}
