//! Social platform abstraction.
//!
//! Each platform binding (Twitter, Discord, Telegram, the local console)
//! implements [`PlatformClient`]. The runtime only relies on this trait;
//! SDK details such as login flows and session cookies stay inside the
//! implementation's `connect()`.

mod console;

pub use console::{ConsoleFactory, ConsolePlatform};

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::character::{Character, PlatformKind};
use crate::error::{ConfigError, ConnectionError, PlatformError};

/// Who the agent is logged in as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformIdentity {
    pub user_id: String,
    pub handle: String,
}

/// A post or message observed on, or published to, a platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub author_id: String,
    pub author_handle: String,
    pub text: String,
    /// Thread the item belongs to. Required before the item can be stored.
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub in_reply_to_item_id: Option<String>,
    pub in_reply_to_user_id: Option<String>,
    #[serde(default)]
    pub in_reply_to_handle: Option<String>,
}

impl Item {
    pub fn contains_link(&self) -> bool {
        self.text.contains("http")
    }
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq)]
pub struct SentItem {
    pub id: String,
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Generated media attached to a post.
#[derive(Debug, Clone, PartialEq)]
pub struct Media {
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub user_id: String,
    pub handle: String,
    pub followers_count: u64,
}

/// A chat message pushed to the agent by a platform.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub platform: PlatformKind,
    pub channel_id: String,
    pub message_id: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    /// Platform-side conversation/session grouping, when there is one.
    pub session_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(
        platform: PlatformKind,
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            platform,
            channel_id: channel_id.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            username: user_id.clone(),
            user_id,
            content: content.into(),
            session_id: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Stream of incoming chat messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A connection to one platform for one agent.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn kind(&self) -> PlatformKind;

    /// Log in / open the gateway connection.
    async fn connect(&self) -> Result<PlatformIdentity, ConnectionError>;

    /// Tear down the connection. Must succeed when nothing is connected.
    async fn disconnect(&self) -> Result<(), ConnectionError>;

    /// Whether the underlying connection is live right now.
    fn is_ready(&self) -> bool;

    async fn send(
        &self,
        text: &str,
        reply_to: Option<&str>,
        media: Option<&Media>,
    ) -> Result<SentItem, PlatformError>;

    /// Answer a chat message in its channel.
    async fn reply(
        &self,
        message: &IncomingMessage,
        text: &str,
    ) -> Result<SentItem, PlatformError> {
        self.send(text, Some(&message.message_id), None).await
    }

    async fn fetch_timeline(&self, _limit: usize) -> Result<Vec<Item>, PlatformError> {
        Err(self.unsupported("timeline"))
    }

    async fn search_mentions(
        &self,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<Item>, PlatformError> {
        Err(self.unsupported("mention search"))
    }

    async fn get_profile(&self, _handle: &str) -> Result<Profile, PlatformError> {
        Err(self.unsupported("profiles"))
    }

    /// Incoming chat messages, for platforms that push them.
    async fn subscribe(&self, _capacity: usize) -> Result<Option<MessageStream>, PlatformError> {
        Ok(None)
    }

    fn unsupported(&self, operation: &str) -> PlatformError {
        PlatformError::Unsupported {
            platform: self.kind().to_string(),
            operation: operation.to_string(),
        }
    }
}

/// Builds platform clients for sessions.
pub trait PlatformFactory: Send + Sync {
    /// Create a client for `character` on `platform`.
    ///
    /// Implementations should fail with `ConfigError::MissingCredentials`
    /// when the character lacks the platform's secrets.
    fn create(
        &self,
        character: &Character,
        platform: PlatformKind,
    ) -> Result<Arc<dyn PlatformClient>, ConfigError>;

    fn supports(&self, platform: PlatformKind) -> bool;
}
