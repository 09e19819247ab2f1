//! Control surface: one session per (character, platform).
//!
//! A session is created on the first `start` for its pair and lives until
//! `cleanup`. It owns the connection, the orchestrator with its scheduled
//! modes, and the chat listener for platforms that push messages.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::chat::ChatResponder;
use crate::agent::connection::{ConnectionLifecycle, ConnectionRegistry, StartOutcome};
use crate::agent::orchestrator::{AgentDeps, AgentOrchestrator, Mode};
use crate::character::{Character, PlatformKind};
use crate::error::{Error, RuntimeError};
use crate::platform::PlatformFactory;

/// Result of [`AgentRuntime::stop`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// False when the mode was not running.
    pub stopped: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeStatus {
    pub mode: Mode,
    pub active: bool,
    pub next_run: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStatus {
    pub is_active: bool,
    pub modes: Vec<ModeStatus>,
}

struct ChatListener {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct AgentSession {
    character: Arc<Character>,
    connection: ConnectionLifecycle,
    orchestrator: Arc<AgentOrchestrator>,
    chat: Mutex<Option<ChatListener>>,
}

impl AgentSession {
    async fn stop_chat(&self) {
        if let Some(listener) = self.chat.lock().await.take() {
            listener.cancel.cancel();
            if let Err(e) = listener.task.await {
                tracing::warn!(agent = %self.connection.agent_key(), error = %e, "Chat listener ended abnormally");
            }
        }
    }

    async fn has_chat(&self) -> bool {
        self.chat.lock().await.is_some()
    }
}

/// Owns every agent session in the process.
pub struct AgentRuntime {
    characters: Vec<Arc<Character>>,
    factory: Arc<dyn PlatformFactory>,
    deps: AgentDeps,
    registry: Arc<ConnectionRegistry>,
    sessions: RwLock<HashMap<String, Arc<AgentSession>>>,
}

impl AgentRuntime {
    pub fn new(
        characters: Vec<Character>,
        factory: Arc<dyn PlatformFactory>,
        deps: AgentDeps,
    ) -> Self {
        Self {
            characters: characters.into_iter().map(Arc::new).collect(),
            factory,
            deps,
            registry: Arc::new(ConnectionRegistry::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn characters(&self) -> &[Arc<Character>] {
        &self.characters
    }

    fn character(&self, name: &str) -> Result<Arc<Character>, RuntimeError> {
        self.characters
            .iter()
            .find(|c| c.username.eq_ignore_ascii_case(name) || c.agent_name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| RuntimeError::AgentNotFound {
                name: name.to_string(),
            })
    }

    async fn session(&self, agent: &str, platform: PlatformKind) -> Option<Arc<AgentSession>> {
        let key = self.character(agent).ok()?.agent_key(platform);
        self.sessions.read().await.get(&key).cloned()
    }

    async fn get_or_create_session(
        &self,
        agent: &str,
        platform: PlatformKind,
    ) -> Result<Arc<AgentSession>, Error> {
        let character = self.character(agent)?;
        let key = character.agent_key(platform);

        if let Some(session) = self.sessions.read().await.get(&key) {
            return Ok(Arc::clone(session));
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&key) {
            return Ok(Arc::clone(session));
        }

        if !self.factory.supports(platform) {
            return Err(RuntimeError::UnsupportedPlatform {
                platform: platform.to_string(),
            }
            .into());
        }
        character.require_credentials(platform)?;
        let client = self.factory.create(&character, platform)?;

        let session = Arc::new(AgentSession {
            character: Arc::clone(&character),
            connection: ConnectionLifecycle::new(
                key.clone(),
                Arc::clone(&client),
                Arc::clone(&self.registry),
            ),
            orchestrator: Arc::new(AgentOrchestrator::new(
                Arc::clone(&character),
                key.clone(),
                client,
                self.deps.clone(),
            )),
            chat: Mutex::new(None),
        });
        sessions.insert(key.clone(), Arc::clone(&session));
        tracing::info!(agent = %key, "Session created");
        Ok(session)
    }

    /// Create the session if needed and make sure it is connected. Chat
    /// platforms also get their message listener started.
    pub async fn connect(&self, agent: &str, platform: PlatformKind) -> Result<(), Error> {
        let session = self.get_or_create_session(agent, platform).await?;

        match session.connection.start().await? {
            StartOutcome::Connected(identity) => session.orchestrator.set_identity(identity),
            StartOutcome::AlreadyActive => {
                if let Some(identity) = session.connection.identity().await {
                    session.orchestrator.set_identity(identity);
                }
            }
        }

        let mut chat = session.chat.lock().await;
        if chat.as_ref().is_some_and(|l| !l.task.is_finished()) {
            return Ok(());
        }
        let client = Arc::clone(session.connection.platform());
        let Some(stream) = client.subscribe(self.deps.config.chat_channel_capacity).await? else {
            return Ok(());
        };
        let responder = ChatResponder::new(
            Arc::clone(&session.character),
            session.orchestrator.agent_key(),
            client,
            self.deps.store.clone(),
            self.deps.generator.clone(),
            self.deps.config.chat_history_limit,
        );
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { responder.run(stream, token).await });
        *chat = Some(ChatListener { cancel, task });
        Ok(())
    }

    /// Start a scheduled mode, connecting first when needed.
    pub async fn start(&self, agent: &str, platform: PlatformKind, mode: Mode) -> Result<(), Error> {
        self.connect(agent, platform).await?;
        let session = self
            .session(agent, platform)
            .await
            .ok_or(RuntimeError::ShuttingDown)?;
        session.orchestrator.start_mode(mode)
    }

    /// Stop one mode. Disconnects once nothing else keeps the session busy.
    pub async fn stop(&self, agent: &str, platform: PlatformKind, mode: Mode) -> StopReport {
        let Some(session) = self.session(agent, platform).await else {
            return StopReport {
                stopped: false,
                message: format!("{agent} is not running on {platform}"),
            };
        };

        if !session.orchestrator.stop_mode(mode) {
            return StopReport {
                stopped: false,
                message: format!("{mode} was not running for {agent} on {platform}"),
            };
        }

        if session.orchestrator.active_modes().is_empty() && !session.has_chat().await {
            session.orchestrator.wait_idle().await;
            // A mode may have been started again while we waited.
            if session.orchestrator.active_modes().is_empty() {
                session.connection.stop().await;
            }
        }
        StopReport {
            stopped: true,
            message: format!("Stopped {mode} for {agent} on {platform}"),
        }
    }

    pub async fn status(&self, agent: &str, platform: PlatformKind) -> AgentStatus {
        let Some(session) = self.session(agent, platform).await else {
            return AgentStatus {
                is_active: false,
                modes: Mode::ALL
                    .into_iter()
                    .map(|mode| ModeStatus {
                        mode,
                        active: false,
                        next_run: None,
                    })
                    .collect(),
            };
        };

        let modes = session
            .orchestrator
            .next_run_times()
            .into_iter()
            .map(|(mode, next_run)| ModeStatus {
                mode,
                active: next_run.is_some(),
                next_run,
            })
            .collect();
        AgentStatus {
            is_active: session.connection.is_active().await,
            modes,
        }
    }

    /// Stop everything for the pair, disconnect, and drop the session
    /// together with its resume points. Returns false when no session existed.
    pub async fn cleanup(&self, agent: &str, platform: PlatformKind) -> bool {
        let Ok(character) = self.character(agent) else {
            return false;
        };
        let key = character.agent_key(platform);
        let Some(session) = self.sessions.write().await.remove(&key) else {
            return false;
        };
        Self::teardown(&session).await;
        tracing::info!(agent = %key, "Session cleaned up");
        true
    }

    async fn teardown(session: &AgentSession) {
        session.orchestrator.cleanup();
        session.stop_chat().await;
        session.orchestrator.wait_idle().await;
        session.connection.stop().await;
    }

    /// Tear down every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        tracing::info!(sessions = sessions.len(), "Shutting down agent runtime");
        for (_, session) in sessions {
            Self::teardown(&session).await;
        }
    }

    /// Agent keys with a live connection.
    pub async fn list_active(&self) -> Vec<String> {
        self.registry.list_active().await
    }
}
