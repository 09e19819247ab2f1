//! Per-agent orchestration of the scheduled modes.
//!
//! One [`AgentOrchestrator`] exists per (character, platform) session. Each
//! active [`Mode`] owns a [`ScheduleHandle`]; every firing runs one tick of
//! that mode to completion before the next delay is drawn.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::agent::novelty::{AcceptAll, EmbeddingSimilarity, NoveltyGuard, SimilarityCheck};
use crate::agent::schedule::{ResumableScheduler, ResumePoint, ScheduleDone, ScheduleHandle};
use crate::agent::throttle::InteractionThrottle;
use crate::character::Character;
use crate::config::RuntimeConfig;
use crate::db::{Database, ItemStore};
use crate::embeddings::EmbeddingService;
use crate::error::{Error, RuntimeError};
use crate::llm::{
    ContentGenerator, GenerationMode, GenerationRequest, MediaGenerator, format_history,
    topic_instruction,
};
use crate::platform::{Item, PlatformClient, PlatformIdentity, SentItem};

/// A scheduled activity of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Unprompted posts about the character's topics.
    TopicPost,
    /// Replies to the most recent eligible timeline item.
    AutoResponse,
    /// Replies to mentions of the agent.
    MentionReply,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::TopicPost, Mode::AutoResponse, Mode::MentionReply];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TopicPost => "topic_post",
            Self::AutoResponse => "auto_response",
            Self::MentionReply => "mention_reply",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "topic" | "topic_post" | "topics" | "post" => Ok(Self::TopicPost),
            "auto" | "auto_response" | "auto_respond" | "autoresponder" | "reply" => {
                Ok(Self::AutoResponse)
            }
            "mention" | "mentions" | "mention_reply" | "reply_to_mentions" => {
                Ok(Self::MentionReply)
            }
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    /// Nothing to do this time; not a failure.
    Skipped(String),
}

/// Collaborators shared by every agent in the process.
#[derive(Clone)]
pub struct AgentDeps {
    pub store: Arc<dyn Database>,
    pub generator: Arc<dyn ContentGenerator>,
    pub media: Option<Arc<dyn MediaGenerator>>,
    /// Published posts are remembered here when set.
    pub embeddings: Option<Arc<dyn EmbeddingService>>,
    pub similarity: Arc<dyn SimilarityCheck>,
    pub config: RuntimeConfig,
    pub scheduler: ResumableScheduler,
}

impl AgentDeps {
    pub fn new(
        store: Arc<dyn Database>,
        generator: Arc<dyn ContentGenerator>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            generator,
            media: None,
            embeddings: None,
            similarity: Arc::new(AcceptAll),
            config,
            scheduler: ResumableScheduler::new(),
        }
    }

    /// Remember published posts and reject candidates too close to them.
    pub fn with_embeddings(mut self, embeddings: Arc<dyn EmbeddingService>) -> Self {
        self.similarity = Arc::new(EmbeddingSimilarity::new(
            Arc::clone(&embeddings),
            self.config.novelty_top_k,
            self.config.novelty_threshold,
        ));
        self.embeddings = Some(embeddings);
        self
    }

    pub fn with_similarity(mut self, similarity: Arc<dyn SimilarityCheck>) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaGenerator>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_scheduler(mut self, scheduler: ResumableScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }
}

struct ModeState {
    handle: ScheduleHandle,
    failures: u32,
    /// Distinguishes this run from earlier runs of the same mode.
    epoch: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Human-readable time until the next run. Minutes are rounded.
pub fn format_time_remaining(remaining: Duration) -> String {
    let minutes = (remaining.as_millis() as f64 / 60_000.0).round() as u64;
    if minutes == 0 {
        return "Running soon...".to_string();
    }
    if minutes == 1 {
        return "1 minute remaining".to_string();
    }
    if minutes < 60 {
        return format!("{minutes} minutes remaining");
    }
    let hours = minutes / 60;
    let rest = minutes % 60;
    let hours_label = if hours == 1 {
        "1 hour".to_string()
    } else {
        format!("{hours} hours")
    };
    if rest > 0 {
        format!("{hours_label} {rest} minutes remaining")
    } else {
        format!("{hours_label} remaining")
    }
}

/// Drives the scheduled modes of one agent on one platform.
pub struct AgentOrchestrator {
    character: Arc<Character>,
    agent_key: String,
    platform: Arc<dyn PlatformClient>,
    deps: AgentDeps,
    throttle: InteractionThrottle,
    novelty: NoveltyGuard,
    identity: RwLock<Option<PlatformIdentity>>,
    modes: Mutex<HashMap<Mode, ModeState>>,
    resume_points: Mutex<HashMap<Mode, ResumePoint>>,
    /// Held for the whole tick so a restarted mode never overlaps its
    /// previous run.
    tick_gates: HashMap<Mode, Arc<tokio::sync::Mutex<()>>>,
    /// Loops of stopped modes that may still be finishing a tick.
    draining: Mutex<Vec<ScheduleDone>>,
    epochs: AtomicU64,
}

impl AgentOrchestrator {
    pub fn new(
        character: Arc<Character>,
        agent_key: impl Into<String>,
        platform: Arc<dyn PlatformClient>,
        deps: AgentDeps,
    ) -> Self {
        let throttle = InteractionThrottle::new(deps.store.clone());
        let novelty = NoveltyGuard::new(deps.config.novelty_max_attempts);
        Self {
            character,
            agent_key: agent_key.into(),
            platform,
            deps,
            throttle,
            novelty,
            identity: RwLock::new(None),
            modes: Mutex::new(HashMap::new()),
            resume_points: Mutex::new(HashMap::new()),
            tick_gates: Mode::ALL
                .into_iter()
                .map(|mode| (mode, Arc::new(tokio::sync::Mutex::new(()))))
                .collect(),
            draining: Mutex::new(Vec::new()),
            epochs: AtomicU64::new(0),
        }
    }

    pub fn agent_key(&self) -> &str {
        &self.agent_key
    }

    pub fn character(&self) -> &Character {
        &self.character
    }

    /// Record who the platform says we are after login.
    pub fn set_identity(&self, identity: PlatformIdentity) {
        if let Ok(mut guard) = self.identity.write() {
            *guard = Some(identity);
        }
    }

    /// Logged-in identity, or the character's configured one before login.
    pub fn identity(&self) -> PlatformIdentity {
        self.identity
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or_else(|| PlatformIdentity {
                user_id: self.character.user_id_str.clone(),
                handle: self.character.username.clone(),
            })
    }

    // ==================== Mode control ====================

    /// Start `mode`. A mode stopped earlier resumes with the time it still
    /// owed; a mode never started (or cleaned up) fires right away.
    pub fn start_mode(self: &Arc<Self>, mode: Mode) -> Result<(), Error> {
        let mut modes = lock(&self.modes);
        if modes.get(&mode).is_some_and(|s| s.handle.is_running()) {
            return Err(RuntimeError::ModeAlreadyActive {
                agent: self.agent_key.clone(),
                mode: mode.to_string(),
            }
            .into());
        }

        let resume = lock(&self.resume_points)
            .remove(&mode)
            .map(|point| point.remaining())
            .unwrap_or(Duration::ZERO);
        let bounds = self.character.posting_behavior.bounds_for(mode);
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst);

        let weak = Arc::downgrade(self);
        let handle = self.deps.scheduler.arm(
            format!("{}/{}", self.agent_key, mode),
            bounds,
            Some(resume),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(this) = weak.upgrade() {
                        this.on_tick(mode, epoch).await;
                    }
                }
            },
        )?;

        tracing::info!(
            agent = %self.agent_key,
            mode = %mode,
            first_run_in_ms = resume.as_millis() as u64,
            "Mode started"
        );
        modes.insert(
            mode,
            ModeState {
                handle,
                failures: 0,
                epoch,
            },
        );
        Ok(())
    }

    /// Stop `mode`, keeping its remaining time for a later restart.
    /// Returns false when the mode was not running.
    pub fn stop_mode(&self, mode: Mode) -> bool {
        let Some(state) = lock(&self.modes).remove(&mode) else {
            return false;
        };
        state.handle.cancel();
        lock(&self.resume_points).insert(mode, state.handle.resume_point());
        let mut draining = lock(&self.draining);
        draining.retain(|done| !done.is_done());
        draining.push(state.handle.done());
        tracing::info!(agent = %self.agent_key, mode = %mode, "Mode stopped");
        true
    }

    /// Wait until ticks of stopped modes have run to completion.
    pub async fn wait_idle(&self) {
        let pending: Vec<ScheduleDone> = lock(&self.draining).drain(..).collect();
        for done in pending {
            if !done.is_done() {
                tracing::debug!(agent = %self.agent_key, "Waiting for running tick to finish");
                done.wait().await;
            }
        }
    }

    /// Stop every mode; returns the ones that were running.
    pub fn stop_all(&self) -> Vec<Mode> {
        Mode::ALL
            .into_iter()
            .filter(|mode| self.stop_mode(*mode))
            .collect()
    }

    /// Stop everything and forget resume points.
    pub fn cleanup(&self) {
        self.stop_all();
        lock(&self.resume_points).clear();
    }

    pub fn is_mode_active(&self, mode: Mode) -> bool {
        lock(&self.modes)
            .get(&mode)
            .is_some_and(|s| s.handle.is_running())
    }

    pub fn active_modes(&self) -> Vec<Mode> {
        Mode::ALL
            .into_iter()
            .filter(|mode| self.is_mode_active(*mode))
            .collect()
    }

    /// Remaining time per mode; `None` for modes that are not running.
    pub fn next_run_times(&self) -> Vec<(Mode, Option<String>)> {
        let modes = lock(&self.modes);
        Mode::ALL
            .into_iter()
            .map(|mode| {
                let next = modes
                    .get(&mode)
                    .filter(|s| s.handle.is_running())
                    .map(|s| format_time_remaining(s.handle.remaining()));
                (mode, next)
            })
            .collect()
    }

    async fn on_tick(&self, mode: Mode, epoch: u64) {
        let result = match self.tick_gates.get(&mode) {
            Some(gate) => {
                let _running = gate.lock().await;
                self.run_tick(mode).await
            }
            None => self.run_tick(mode).await,
        };

        let mut modes = lock(&self.modes);
        let Some(state) = modes.get_mut(&mode).filter(|s| s.epoch == epoch) else {
            return;
        };
        match result {
            Ok(TickOutcome::Completed) => {
                state.failures = 0;
                tracing::debug!(agent = %self.agent_key, mode = %mode, "Tick completed");
            }
            Ok(TickOutcome::Skipped(reason)) => {
                state.failures = 0;
                tracing::info!(agent = %self.agent_key, mode = %mode, reason = %reason, "Tick skipped");
            }
            Err(e) => {
                state.failures += 1;
                let failures = state.failures;
                tracing::error!(
                    agent = %self.agent_key,
                    mode = %mode,
                    failures,
                    error = %e,
                    "Tick failed"
                );
                if failures >= self.deps.config.max_consecutive_failures {
                    tracing::warn!(
                        agent = %self.agent_key,
                        mode = %mode,
                        failures,
                        "Too many consecutive failures, pausing mode"
                    );
                    if let Some(state) = modes.remove(&mode) {
                        state.handle.cancel();
                    }
                }
            }
        }
    }

    /// Run one tick of `mode` now.
    pub async fn run_tick(&self, mode: Mode) -> Result<TickOutcome, Error> {
        tracing::debug!(agent = %self.agent_key, mode = %mode, "Running tick");
        match mode {
            Mode::TopicPost => self.topic_post().await,
            Mode::AutoResponse => self.auto_respond().await,
            Mode::MentionReply => self.reply_to_mentions().await,
        }
    }

    // ==================== Topic posts ====================

    async fn topic_post(&self) -> Result<TickOutcome, Error> {
        let character = &*self.character;
        let generator = &self.deps.generator;

        let accepted = self
            .novelty
            .accept(
                &self.agent_key,
                || {
                    let input = topic_instruction(character, &mut rand::thread_rng());
                    async move {
                        generator
                            .generate(&GenerationRequest::new(
                                character,
                                GenerationMode::TopicPost,
                                input,
                            ))
                            .await
                    }
                },
                self.deps.similarity.as_ref(),
            )
            .await?;
        let Some(generation) = accepted else {
            return Ok(TickOutcome::Skipped(format!(
                "no novel content after {} attempts",
                self.novelty.max_attempts()
            )));
        };

        let media = self.maybe_media(&generation.content).await;
        let sent = self
            .platform
            .send(&generation.content, None, media.as_ref())
            .await?;

        let own = self.identity();
        let post = Item {
            conversation_id: Some(sent.conversation_id.clone().unwrap_or_else(|| sent.id.clone())),
            id: sent.id.clone(),
            author_id: own.user_id,
            author_handle: own.handle,
            text: generation.content.clone(),
            created_at: sent.created_at,
            in_reply_to_item_id: None,
            in_reply_to_user_id: None,
            in_reply_to_handle: None,
        };
        self.deps.store.save_item(&self.agent_key, &post).await?;
        self.deps.store.save_prompt(&post.id, &generation.prompt).await?;

        if let Some(embeddings) = &self.deps.embeddings
            && let Err(e) = embeddings.remember(&self.agent_key, &post.id, &post.text).await
        {
            tracing::warn!(agent = %self.agent_key, item_id = %post.id, error = %e, "Failed to store post embedding");
        }

        tracing::info!(
            agent = %self.agent_key,
            item_id = %post.id,
            with_media = media.is_some(),
            "Published topic post"
        );
        Ok(TickOutcome::Completed)
    }

    async fn maybe_media(&self, text: &str) -> Option<crate::platform::Media> {
        let media = self.deps.media.as_ref()?;
        let chance = self.character.posting_behavior.image_chance();
        let roll: f64 = rand::thread_rng().gen_range(0.0..1.0);
        if roll >= chance {
            return None;
        }
        match media.generate_media(&self.character, text).await {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(agent = %self.agent_key, error = %e, "Media generation failed, posting text only");
                None
            }
        }
    }

    // ==================== Timeline replies ====================

    async fn auto_respond(&self) -> Result<TickOutcome, Error> {
        let own = self.identity();
        let config = &self.deps.config;
        let timeline = self.platform.fetch_timeline(config.timeline_limit).await?;
        let fetched = timeline.len();

        let mut eligible = Vec::new();
        for item in timeline {
            if item.author_id == own.user_id
                || item.contains_link()
                || self.character.posting_behavior.is_muted(&item.author_handle)
            {
                continue;
            }
            match self.deps.store.get_item(&self.agent_key, &item.id).await {
                Ok(None) => {}
                Ok(Some(_)) => continue,
                Err(e) => {
                    tracing::warn!(agent = %self.agent_key, item_id = %item.id, error = %e, "Lookup failed, skipping item");
                    continue;
                }
            }
            if !self
                .throttle
                .allow(
                    &self.agent_key,
                    &item.author_id,
                    config.interaction_window,
                    config.interaction_limit,
                )
                .await
            {
                continue;
            }
            eligible.push(item);
        }

        tracing::debug!(agent = %self.agent_key, fetched, eligible = eligible.len(), "Filtered timeline");
        let Some(target) = eligible.into_iter().max_by_key(|item| item.created_at) else {
            return Ok(TickOutcome::Skipped("no eligible timeline items".to_string()));
        };

        let mut history = self.recent_items(&own.user_id).await;
        history.extend(self.recent_items(&target.author_id).await);
        self.reply_to(&own, &target, format_history(&history)).await?;
        Ok(TickOutcome::Completed)
    }

    async fn recent_items(&self, author_id: &str) -> Vec<Item> {
        self.deps
            .store
            .list_history(&self.agent_key, author_id, self.deps.config.history_limit)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(agent = %self.agent_key, error = %e, "History lookup failed");
                Vec::new()
            })
    }

    async fn conversation_items(&self, conversation_id: &str) -> Vec<Item> {
        self.deps
            .store
            .list_conversation(&self.agent_key, conversation_id, self.deps.config.history_limit)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(agent = %self.agent_key, error = %e, "Conversation lookup failed");
                Vec::new()
            })
    }

    /// Generate, send, then persist source, reply and prompt.
    async fn reply_to(
        &self,
        own: &PlatformIdentity,
        target: &Item,
        history: String,
    ) -> Result<SentItem, Error> {
        let request =
            GenerationRequest::new(&self.character, GenerationMode::Reply, target.text.clone())
                .with_history(history);
        let generation = self.deps.generator.generate(&request).await?;
        let sent = self
            .platform
            .send(&generation.content, Some(&target.id), None)
            .await?;

        let mut source = target.clone();
        if source.conversation_id.is_none() {
            source.conversation_id = Some(target.id.clone());
        }
        let reply = Item {
            id: sent.id.clone(),
            author_id: own.user_id.clone(),
            author_handle: own.handle.clone(),
            text: generation.content,
            conversation_id: sent
                .conversation_id
                .clone()
                .or_else(|| source.conversation_id.clone()),
            created_at: sent.created_at,
            in_reply_to_item_id: Some(target.id.clone()),
            in_reply_to_user_id: Some(target.author_id.clone()),
            in_reply_to_handle: Some(target.author_handle.clone()),
        };
        self.deps.store.save_item(&self.agent_key, &source).await?;
        self.deps.store.save_item(&self.agent_key, &reply).await?;
        self.deps.store.save_prompt(&reply.id, &generation.prompt).await?;

        tracing::info!(
            agent = %self.agent_key,
            item_id = %reply.id,
            in_reply_to = %target.id,
            user = %target.author_handle,
            "Sent reply"
        );
        Ok(sent)
    }

    // ==================== Mentions ====================

    fn mention_query(&self, handle: &str) -> String {
        let mut query = format!("@{handle} -from:{handle} -filter:retweets");
        if self.character.posting_behavior.should_ignore_twitter_replies {
            query.push_str(" -filter:replies");
        }
        query
    }

    async fn reply_to_mentions(&self) -> Result<TickOutcome, Error> {
        let own = self.identity();
        let config = &self.deps.config;
        let mentions = self
            .platform
            .search_mentions(&self.mention_query(&own.handle), config.mention_limit)
            .await?;

        let mut eligible = Vec::new();
        for mut mention in mentions {
            match self.platform.get_profile(&mention.author_handle).await {
                Ok(profile) if profile.followers_count < config.min_follower_count => {
                    tracing::info!(
                        agent = %self.agent_key,
                        item_id = %mention.id,
                        user = %mention.author_handle,
                        followers = profile.followers_count,
                        "Skipping mention from small account"
                    );
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(agent = %self.agent_key, user = %mention.author_handle, error = %e, "Profile lookup failed");
                    continue;
                }
            }
            // Parent author is only known for parents we stored ourselves.
            if let Some(parent) = &mention.in_reply_to_item_id
                && let Ok(Some(stored)) = self.deps.store.get_item(&self.agent_key, parent).await
            {
                mention.in_reply_to_user_id = Some(stored.author_id);
                mention.in_reply_to_handle = Some(stored.author_handle);
            }
            eligible.push(mention);
        }
        eligible.sort_by_key(|m| m.created_at);

        if eligible.is_empty() {
            return Ok(TickOutcome::Skipped("no mentions".to_string()));
        }

        let (mut replied, mut failed) = (0u32, 0u32);
        for mention in &eligible {
            if let Some(reason) = self.mention_skip_reason(&own, mention).await {
                tracing::info!(agent = %self.agent_key, item_id = %mention.id, reason, "Skipping mention");
                continue;
            }

            tokio::time::sleep(config.mention_reply_delay).await;

            let mut history = self.recent_items(&mention.author_id).await;
            if let Some(conversation) = &mention.conversation_id {
                history.extend(self.conversation_items(conversation).await);
            }
            match self.reply_to(&own, mention, format_history(&history)).await {
                Ok(_) => replied += 1,
                Err(e) => {
                    failed += 1;
                    tracing::error!(agent = %self.agent_key, item_id = %mention.id, error = %e, "Failed to reply to mention");
                }
            }
        }

        tracing::info!(agent = %self.agent_key, found = eligible.len(), replied, failed, "Finished mention batch");
        Ok(TickOutcome::Completed)
    }

    /// Why a mention should not be answered, if it shouldn't.
    async fn mention_skip_reason(&self, own: &PlatformIdentity, mention: &Item) -> Option<&'static str> {
        if mention.id.is_empty() || mention.author_id.is_empty() || mention.text.is_empty() {
            return Some("missing id, author or text");
        }

        if let Some(conversation) = &mention.conversation_id {
            let thread = match self
                .deps
                .store
                .list_conversation(&self.agent_key, conversation, self.deps.config.history_limit)
                .await
            {
                Ok(items) => items,
                Err(_) => return Some("conversation lookup failed"),
            };
            let in_thread = thread.iter().any(|i| i.author_id == own.user_id);
            let replies_to_us = mention.in_reply_to_user_id.as_deref() == Some(own.user_id.as_str());
            if in_thread && !replies_to_us {
                return Some("already in conversation and not a reply to the agent");
            }
        }

        match self.deps.store.get_item(&self.agent_key, &mention.id).await {
            Ok(Some(_)) => return Some("already processed"),
            Ok(None) => {}
            Err(_) => return Some("lookup failed"),
        }

        let config = &self.deps.config;
        if !self
            .throttle
            .allow(
                &self.agent_key,
                &mention.author_id,
                config.interaction_window,
                config.interaction_limit,
            )
            .await
        {
            return Some("too many recent interactions");
        }

        if self.character.posting_behavior.is_muted(&mention.author_handle) {
            return Some("user is muted");
        }
        None
    }
}

impl fmt::Debug for AgentOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentOrchestrator")
            .field("agent_key", &self.agent_key)
            .field("active_modes", &self.active_modes())
            .finish()
    }
}
