//! Conversational replies for platforms that push chat messages.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::character::Character;
use crate::db::{ChatMessage, ChatStore};
use crate::error::Error;
use crate::llm::{ContentGenerator, GenerationMode, GenerationRequest};
use crate::platform::{IncomingMessage, MessageStream, PlatformClient};

const MESSAGE_TYPE_TEXT: &str = "text";

/// Answers chat turns for one agent, one message at a time.
pub struct ChatResponder {
    character: Arc<Character>,
    agent_key: String,
    platform: Arc<dyn PlatformClient>,
    store: Arc<dyn ChatStore>,
    generator: Arc<dyn ContentGenerator>,
    history_limit: usize,
}

impl ChatResponder {
    pub fn new(
        character: Arc<Character>,
        agent_key: impl Into<String>,
        platform: Arc<dyn PlatformClient>,
        store: Arc<dyn ChatStore>,
        generator: Arc<dyn ContentGenerator>,
        history_limit: usize,
    ) -> Self {
        Self {
            character,
            agent_key: agent_key.into(),
            platform,
            store,
            generator,
            history_limit,
        }
    }

    /// Drain `stream` until it ends or `cancel` fires. A failed turn is
    /// logged and the next message is processed.
    pub async fn run(&self, mut stream: MessageStream, cancel: CancellationToken) {
        tracing::info!(agent = %self.agent_key, "Chat listener started");
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            if let Err(e) = self.handle_turn(&message).await {
                tracing::error!(
                    agent = %self.agent_key,
                    channel = %message.channel_id,
                    error = %e,
                    "Chat turn failed"
                );
            }
        }
        tracing::info!(agent = %self.agent_key, "Chat listener stopped");
    }

    /// Save the user row, generate with channel history, reply, then save
    /// the bot row. Nothing is saved for the bot when generation or the
    /// reply fails.
    pub async fn handle_turn(&self, message: &IncomingMessage) -> Result<String, Error> {
        self.store.save_chat_message(&self.user_row(message)).await?;

        let history = self
            .store
            .list_chat_messages(
                &self.agent_key,
                message.platform.as_str(),
                &message.channel_id,
                self.history_limit,
            )
            .await?;

        let request = GenerationRequest::new(
            &self.character,
            GenerationMode::Chat,
            message.content.clone(),
        )
        .with_history(format_chat_history(&history, &self.character.username));
        let generation = self.generator.generate(&request).await?;

        let sent = self.platform.reply(message, &generation.content).await?;

        let mut bot = self.user_row(message);
        bot.message_id = Some(sent.id);
        bot.user_id = None;
        bot.username = Some(self.character.username.clone());
        bot.content = generation.content.clone();
        bot.is_bot_response = true;
        bot.prompt = Some(generation.prompt);
        bot.created_at = Utc::now();
        self.store.save_chat_message(&bot).await?;

        tracing::debug!(agent = %self.agent_key, channel = %message.channel_id, "Answered chat message");
        Ok(generation.content)
    }

    fn user_row(&self, message: &IncomingMessage) -> ChatMessage {
        ChatMessage {
            id: None,
            agent_id: self.agent_key.clone(),
            platform: message.platform.as_str().to_string(),
            channel_id: Some(message.channel_id.clone()),
            message_id: Some(message.message_id.clone()),
            user_id: Some(message.user_id.clone()),
            username: Some(message.username.clone()),
            session_id: message.session_id.clone(),
            content: message.content.clone(),
            message_type: MESSAGE_TYPE_TEXT.to_string(),
            metadata: None,
            is_bot_response: false,
            prompt: None,
            created_at: message.received_at,
        }
    }
}

/// Render chat rows oldest first, one line per turn.
fn format_chat_history(history: &[ChatMessage], agent_handle: &str) -> String {
    history
        .iter()
        .map(|m| {
            let speaker = if m.is_bot_response {
                agent_handle
            } else {
                m.username.as_deref().or(m.user_id.as_deref()).unwrap_or("user")
            };
            format!("{speaker}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::character::PlatformKind;
    use crate::testing::{StubGenerator, StubPlatform, test_db};

    async fn responder(
        generator: Arc<StubGenerator>,
        platform: Arc<StubPlatform>,
    ) -> (ChatResponder, Arc<dyn crate::db::Database>, tempfile::TempDir) {
        let (db, dir) = test_db().await;
        let responder = ChatResponder::new(
            Arc::new(Character::new("Ava", "ava")),
            "console:ava",
            platform,
            db.clone(),
            generator,
            20,
        );
        (responder, db, dir)
    }

    fn console_platform() -> Arc<StubPlatform> {
        let platform = Arc::new(StubPlatform::new().with_kind(PlatformKind::Console));
        platform.set_ready(true);
        platform
    }

    #[tokio::test]
    async fn turn_saves_user_and_bot_rows() {
        let generator = Arc::new(StubGenerator::new().with_responses(["hey there"]));
        let platform = console_platform();
        let (responder, db, _dir) = responder(generator.clone(), platform.clone()).await;

        let first = IncomingMessage::new(PlatformKind::Console, "s1", "me", "hello ava");
        assert_eq!(responder.handle_turn(&first).await.unwrap(), "hey there");
        let second = IncomingMessage::new(PlatformKind::Console, "s1", "me", "how are you");
        responder.handle_turn(&second).await.unwrap();

        let rows = db.list_chat_messages("console:ava", "console", "s1", 10).await.unwrap();
        assert_eq!(rows.len(), 4);
        assert!(!rows[0].is_bot_response);
        assert!(rows[1].is_bot_response);
        assert_eq!(rows[1].content, "hey there");
        assert!(rows[1].prompt.is_some());

        let requests = generator.requests();
        assert_eq!(requests[1].mode, GenerationMode::Chat);
        assert_eq!(
            requests[1].history.as_deref(),
            Some("me: hello ava\nava: hey there\nme: how are you")
        );
        assert_eq!(platform.sent().len(), 2);
    }

    #[tokio::test]
    async fn generation_failure_saves_no_bot_row() {
        let generator = Arc::new(StubGenerator::new());
        generator.set_failing(true);
        let (responder, db, _dir) = responder(generator, console_platform()).await;

        let msg = IncomingMessage::new(PlatformKind::Console, "s1", "me", "hello");
        assert!(responder.handle_turn(&msg).await.is_err());

        let rows = db.list_chat_messages("console:ava", "console", "s1", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].is_bot_response);
    }

    #[tokio::test]
    async fn run_processes_stream_in_order() {
        let generator = Arc::new(StubGenerator::new());
        let platform = console_platform();
        let (responder, db, _dir) = responder(generator, platform.clone()).await;

        for text in ["one", "two", "three"] {
            platform.push_message(IncomingMessage::new(PlatformKind::Console, "s1", "me", text));
        }
        let stream = platform.subscribe(8).await.unwrap().unwrap();

        let cancel = CancellationToken::new();
        let run = responder.run(stream, cancel.clone());
        tokio::pin!(run);
        // The stub keeps its sender alive, so stop once all turns are saved.
        loop {
            tokio::select! {
                _ = &mut run => break,
                _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {
                    let rows = db.list_chat_messages("console:ava", "console", "s1", 10).await.unwrap();
                    if rows.len() == 6 {
                        cancel.cancel();
                    }
                }
            }
        }

        let rows = db.list_chat_messages("console:ava", "console", "s1", 10).await.unwrap();
        let users: Vec<&str> = rows
            .iter()
            .filter(|r| !r.is_bot_response)
            .map(|r| r.content.as_str())
            .collect();
        assert_eq!(users, vec!["one", "two", "three"]);
    }
}
