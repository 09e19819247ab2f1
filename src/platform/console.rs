//! Local console platform.
//!
//! Posts are printed to stdout and chat messages are read from the terminal
//! through a rustyline editor. Useful for running a character locally without platform
//! credentials.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::character::{Character, PlatformKind};
use crate::error::{ConfigError, ConnectionError, PlatformError};
use crate::platform::{
    IncomingMessage, Item, Media, MessageStream, PlatformClient, PlatformFactory, PlatformIdentity,
    SentItem,
};

pub struct ConsolePlatform {
    handle: String,
    ready: AtomicBool,
    sent: AtomicU64,
}

impl ConsolePlatform {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            ready: AtomicBool::new(false),
            sent: AtomicU64::new(0),
        }
    }

    /// Number of items printed since creation.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PlatformClient for ConsolePlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Console
    }

    async fn connect(&self) -> Result<PlatformIdentity, ConnectionError> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(PlatformIdentity {
            user_id: format!("console-{}", self.handle),
            handle: self.handle.clone(),
        })
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn send(
        &self,
        text: &str,
        reply_to: Option<&str>,
        media: Option<&Media>,
    ) -> Result<SentItem, PlatformError> {
        if !self.is_ready() {
            return Err(PlatformError::NotConnected {
                platform: PlatformKind::Console.to_string(),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        match reply_to {
            Some(parent) => println!(
                "\x1b[1;35m@{}\x1b[0m \x1b[90m(re {parent})\x1b[0m {text}",
                self.handle
            ),
            None => println!("\x1b[1;35m@{}\x1b[0m {text}", self.handle),
        }
        if let Some(media) = media {
            println!(
                "\x1b[90m  [{} attachment, {} bytes]\x1b[0m",
                media.mime_type,
                media.data.len()
            );
        }
        self.sent.fetch_add(1, Ordering::Relaxed);

        Ok(SentItem {
            conversation_id: Some(reply_to.map(str::to_string).unwrap_or_else(|| id.clone())),
            id,
            created_at: Utc::now(),
        })
    }

    async fn fetch_timeline(&self, _limit: usize) -> Result<Vec<Item>, PlatformError> {
        Ok(Vec::new())
    }

    async fn search_mentions(
        &self,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<Item>, PlatformError> {
        Ok(Vec::new())
    }

    async fn subscribe(&self, capacity: usize) -> Result<Option<MessageStream>, PlatformError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        std::thread::spawn(move || {
            let mut rl = match DefaultEditor::new() {
                Ok(editor) => editor,
                Err(e) => {
                    eprintln!("Failed to initialize line editor: {e}");
                    return;
                }
            };

            println!("\x1b[1mChat\x1b[0m  /quit to exit");
            loop {
                let line = match rl.readline("\x1b[1;36m\u{203A}\x1b[0m ") {
                    Ok(line) => line,
                    Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
                    Err(e) => {
                        eprintln!("Input error: {e}");
                        break;
                    }
                };
                let Some(msg) = chat_message(&line) else {
                    if is_quit(&line) {
                        break;
                    }
                    continue;
                };
                let _ = rl.add_history_entry(line.trim());
                if tx.blocking_send(msg).is_err() {
                    break;
                }
            }
        });

        Ok(Some(Box::pin(ReceiverStream::new(rx))))
    }
}

fn is_quit(line: &str) -> bool {
    matches!(line.trim().to_lowercase().as_str(), "/quit" | "/exit")
}

/// Turn one input line into a chat message; blank lines and quit commands
/// produce none.
fn chat_message(line: &str) -> Option<IncomingMessage> {
    let line = line.trim();
    if line.is_empty() || is_quit(line) {
        return None;
    }
    Some(
        IncomingMessage::new(PlatformKind::Console, "console", "operator", line)
            .with_username("you")
            .with_session("console"),
    )
}

/// Creates console clients; every other platform needs an SDK binding.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleFactory;

impl PlatformFactory for ConsoleFactory {
    fn create(
        &self,
        character: &Character,
        platform: PlatformKind,
    ) -> Result<Arc<dyn PlatformClient>, ConfigError> {
        match platform {
            PlatformKind::Console => Ok(Arc::new(ConsolePlatform::new(&character.username))),
            other => Err(ConfigError::InvalidValue {
                key: "platform".to_string(),
                message: format!("no client binding for {other}"),
            }),
        }
    }

    fn supports(&self, platform: PlatformKind) -> bool {
        platform == PlatformKind::Console
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_requires_connection() {
        let console = ConsolePlatform::new("ava");
        let err = console.send("hello", None, None).await.unwrap_err();
        assert!(matches!(err, PlatformError::NotConnected { .. }));

        let identity = console.connect().await.unwrap();
        assert_eq!(identity.handle, "ava");
        let sent = console.send("hello", None, None).await.unwrap();
        assert_eq!(sent.conversation_id.as_deref(), Some(sent.id.as_str()));
        assert_eq!(console.sent_count(), 1);

        console.disconnect().await.unwrap();
        assert!(!console.is_ready());
    }

    #[test]
    fn input_lines_become_chat_messages() {
        let msg = chat_message("  hello there ").unwrap();
        assert_eq!(msg.content, "hello there");
        assert_eq!(msg.platform, PlatformKind::Console);

        assert!(chat_message("   ").is_none());
        assert!(chat_message("/QUIT").is_none());
        assert!(is_quit(" /exit"));
        assert!(!is_quit("/quitting"));
    }

    #[test]
    fn factory_only_builds_console() {
        let character = Character::new("Ava", "ava");
        assert!(ConsoleFactory.create(&character, PlatformKind::Console).is_ok());
        assert!(ConsoleFactory.create(&character, PlatformKind::Twitter).is_err());
        assert!(!ConsoleFactory.supports(PlatformKind::Discord));
    }
}
