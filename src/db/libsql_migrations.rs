//! Schema for the libSQL backend.
//!
//! Every statement is idempotent so the batch runs on each startup.
//! Timestamps are RFC 3339 text with millisecond precision in UTC, which
//! keeps lexicographic and chronological order identical.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    agent_id TEXT NOT NULL,
    id TEXT NOT NULL,
    author_id TEXT NOT NULL,
    author_handle TEXT NOT NULL,
    text TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    in_reply_to_item_id TEXT,
    in_reply_to_user_id TEXT,
    in_reply_to_handle TEXT,
    PRIMARY KEY (agent_id, id)
);

CREATE INDEX IF NOT EXISTS idx_items_author ON items(agent_id, author_id, created_at);
CREATE INDEX IF NOT EXISTS idx_items_conversation ON items(agent_id, conversation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_items_reply_user ON items(agent_id, in_reply_to_user_id, created_at);

CREATE TABLE IF NOT EXISTS prompts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id TEXT NOT NULL,
    prompt TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_prompts_item ON prompts(item_id);

CREATE TABLE IF NOT EXISTS chat_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL,
    platform TEXT NOT NULL,
    platform_channel_id TEXT,
    platform_message_id TEXT,
    platform_user_id TEXT,
    username TEXT,
    session_id TEXT,
    message_content TEXT NOT NULL,
    message_type TEXT NOT NULL DEFAULT 'text',
    metadata TEXT,
    is_bot_response INTEGER NOT NULL DEFAULT 0,
    prompt TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chat_messages_channel
    ON chat_messages(agent_id, platform, platform_channel_id, id);

CREATE TABLE IF NOT EXISTS embeddings (
    agent_id TEXT NOT NULL,
    item_id TEXT NOT NULL,
    text TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    vector BLOB NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (agent_id, item_id)
);

CREATE INDEX IF NOT EXISTS idx_embeddings_agent ON embeddings(agent_id, dimension);
"#;
