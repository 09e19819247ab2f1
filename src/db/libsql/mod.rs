//! libSQL backend for the Database trait.
//!
//! Provides an embedded SQLite-compatible database using Turso's libSQL
//! fork, either file-based or in-memory (for tests).

mod chat;
mod items;
mod vectors;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase};

use crate::db::libsql_migrations;
use crate::db::{ChatMessage, Database};
use crate::error::DatabaseError;
use crate::platform::Item;

/// Explicit column list for the items table (matches `row_to_item`).
pub(crate) const ITEM_COLUMNS: &str = "\
    id, author_id, author_handle, text, conversation_id, created_at, \
    in_reply_to_item_id, in_reply_to_user_id, in_reply_to_handle";

/// Explicit column list for chat_messages (matches `row_to_chat_message`).
pub(crate) const CHAT_COLUMNS: &str = "\
    id, agent_id, platform, platform_channel_id, platform_message_id, platform_user_id, \
    username, session_id, message_content, message_type, metadata, is_bot_response, \
    prompt, created_at";

/// libSQL database backend.
pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
}

impl LibSqlBackend {
    /// Create a new local embedded database.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {}", e))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Create a new in-memory database.
    ///
    /// Each connection to `:memory:` sees its own database, so this is only
    /// useful for single-connection checks.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {}", e))
            })?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Create a new connection to the database.
    ///
    /// Sets `PRAGMA busy_timeout = 5000` on every connection so concurrent
    /// writers wait up to 5 seconds instead of failing with "database is
    /// locked".
    pub async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {}", e)))?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy_timeout: {}", e)))?;
        Ok(conn)
    }
}

// ==================== Helper functions ====================

/// Parse a timestamp string from SQLite into DateTime<Utc>.
///
/// Accepts RFC 3339 (the write format) and SQLite's naive
/// `YYYY-MM-DD HH:MM:SS[.fff]` output.
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(format!("unparseable timestamp: {:?}", s))
}

/// Format a DateTime<Utc> for SQLite storage (RFC 3339 with millisecond precision).
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Extract a text column from a libsql Row, returning empty string for NULL.
pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

/// Extract an optional text column.
/// Returns None for SQL NULL, preserves empty strings as Some("").
pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

/// Convert an `Option<&str>` to a `libsql::Value` (Text or Null).
pub(crate) fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Extract an i64 column, defaulting to 0.
pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or(0)
}

/// Parse a timestamp from a text column.
///
/// A NULL or unparseable value logs a warning and yields the Unix epoch so
/// the problem stays visible instead of masquerading as "now".
pub(crate) fn get_ts(row: &libsql::Row, idx: i32) -> DateTime<Utc> {
    match row.get::<String>(idx) {
        Ok(s) => match parse_timestamp(&s) {
            Ok(dt) => dt,
            Err(e) => {
                tracing::warn!("Timestamp parse failure at column {}: {}", idx, e);
                DateTime::UNIX_EPOCH
            }
        },
        Err(_) => DateTime::UNIX_EPOCH,
    }
}

/// Parse an optional JSON value from a text column.
pub(crate) fn get_opt_json(row: &libsql::Row, idx: i32) -> Option<serde_json::Value> {
    row.get::<String>(idx)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}

/// SQLite wants signed limits.
pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        // WAL persists in the file: readers stop blocking writers.
        conn.query("PRAGMA journal_mode=WAL", ())
            .await
            .map_err(|e| DatabaseError::Migration(format!("Failed to enable WAL mode: {}", e)))?;
        conn.execute_batch(libsql_migrations::SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(format!("libSQL migration failed: {}", e)))?;
        Ok(())
    }
}

// ==================== Row conversion helpers ====================

pub(crate) fn row_to_item(row: &libsql::Row) -> Item {
    Item {
        id: get_text(row, 0),
        author_id: get_text(row, 1),
        author_handle: get_text(row, 2),
        text: get_text(row, 3),
        conversation_id: get_opt_text(row, 4),
        created_at: get_ts(row, 5),
        in_reply_to_item_id: get_opt_text(row, 6),
        in_reply_to_user_id: get_opt_text(row, 7),
        in_reply_to_handle: get_opt_text(row, 8),
    }
}

pub(crate) fn row_to_chat_message(row: &libsql::Row) -> ChatMessage {
    ChatMessage {
        id: Some(get_i64(row, 0)),
        agent_id: get_text(row, 1),
        platform: get_text(row, 2),
        channel_id: get_opt_text(row, 3),
        message_id: get_opt_text(row, 4),
        user_id: get_opt_text(row, 5),
        username: get_opt_text(row, 6),
        session_id: get_opt_text(row, 7),
        content: get_text(row, 8),
        message_type: get_text(row, 9),
        metadata: get_opt_json(row, 10),
        is_bot_response: get_i64(row, 11) != 0,
        prompt: get_opt_text(row, 12),
        created_at: get_ts(row, 13),
    }
}
