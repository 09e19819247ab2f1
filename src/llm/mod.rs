//! Content generation for personas.
//!
//! The runtime only depends on [`ContentGenerator`] and [`MediaGenerator`].
//! [`OpenAiCompatGenerator`] is the production implementation and talks to
//! any endpoint speaking the OpenAI chat completions API.

mod openai_compat;
mod prompt;
pub(crate) mod retry;

pub use openai_compat::OpenAiCompatGenerator;
pub use prompt::{build_system_prompt, format_history, format_reply, topic_instruction};

use async_trait::async_trait;

use crate::character::Character;
use crate::error::LlmError;
use crate::platform::Media;

/// What the generated text is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    /// Unprompted post about one of the character's topics.
    TopicPost,
    /// Reply to a timeline item or mention.
    Reply,
    /// Conversational answer in a chat channel.
    Chat,
}

impl GenerationMode {
    /// Length limits and reformatting apply to public posts only.
    pub fn is_public_post(&self) -> bool {
        !matches!(self, Self::Chat)
    }
}

/// Input to one generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub character: &'a Character,
    pub mode: GenerationMode,
    /// Text being answered, or the topic instruction for topic posts.
    pub input: String,
    /// Recent conversation rendered as plain text.
    pub history: Option<String>,
}

impl<'a> GenerationRequest<'a> {
    pub fn new(character: &'a Character, mode: GenerationMode, input: impl Into<String>) -> Self {
        Self {
            character,
            mode,
            input: input.into(),
            history: None,
        }
    }

    pub fn with_history(mut self, history: impl Into<String>) -> Self {
        let history = history.into();
        if !history.is_empty() {
            self.history = Some(history);
        }
        self
    }
}

/// Generated text plus the system prompt that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub prompt: String,
    pub content: String,
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<Generation, LlmError>;
}

/// Produces an image (or other media) to attach to a post.
#[async_trait]
pub trait MediaGenerator: Send + Sync {
    async fn generate_media(&self, character: &Character, text: &str) -> Result<Media, LlmError>;
}
