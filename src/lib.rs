//! Persona Runtime
//!
//! Runs LLM-driven social media personas. Each character from the
//! characters file can be bound to one or more platforms, where it posts
//! about its topics, replies to its timeline and mentions, and answers chat
//! messages.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            AgentRuntime                              │
//! │   one session per (character, platform): start / stop / status       │
//! └──────────┬───────────────────────────────┬───────────────────────────┘
//!            ▼                               ▼
//! ┌─────────────────────┐        ┌──────────────────────────────────────┐
//! │ ConnectionLifecycle │        │          AgentOrchestrator           │
//! │  one live login per │        │  topic post │ auto-response │ mention │
//! │  agent, process-wide│        │      ResumableScheduler per mode     │
//! └──────────┬──────────┘        └───┬──────────────┬──────────────┬────┘
//!            │                       ▼              ▼              ▼
//!            │               NoveltyGuard   InteractionThrottle  ChatResponder
//!            ▼                       │              │              │
//! ┌──────────────────────────────────┴──────────────┴──────────────┴────┐
//! │   PlatformClient    ContentGenerator    Database    Embeddings       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod character;
pub mod cli;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod llm;
pub mod platform;
pub mod testing;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::agent::{AgentDeps, AgentRuntime, Mode};
    pub use crate::character::{Character, PlatformKind};
    pub use crate::config::Config;
    pub use crate::db::Database;
    pub use crate::error::{Error, Result};
    pub use crate::llm::{ContentGenerator, GenerationMode, GenerationRequest};
    pub use crate::platform::{IncomingMessage, Item, MessageStream, PlatformClient};
}
