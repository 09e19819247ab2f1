//! Test doubles for the runtime's collaborators.
//!
//! Provides:
//! - [`test_db`]: a migrated libSQL database in a temporary directory
//! - [`StubPlatform`]: scriptable platform client with call counters
//! - [`StubGenerator`] / [`StubMedia`]: content generation doubles
//! - [`HashEmbeddings`] / [`StubSimilarity`]: deterministic embeddings and
//!   scripted similarity verdicts
//!
//! # Usage
//!
//! ```rust,no_run
//! use persona_runtime::testing::{StubPlatform, test_db};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let (db, _dir) = test_db().await;
//!     let platform = StubPlatform::new();
//!     // wire them into an orchestrator
//! }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::character::{Character, PlatformKind};
use crate::db::{Database, InteractionStore};
use crate::embeddings::EmbeddingProvider;
use crate::error::{
    ConfigError, ConnectionError, DatabaseError, EmbeddingError, LlmError, PlatformError,
};
use crate::agent::SimilarityCheck;
use crate::llm::{ContentGenerator, Generation, GenerationMode, GenerationRequest, MediaGenerator};
use crate::platform::{
    IncomingMessage, Item, Media, MessageStream, PlatformClient, PlatformFactory,
    PlatformIdentity, Profile, SentItem,
};

/// Create a libSQL-backed test database in a temporary directory.
///
/// Returns the database and a `TempDir` guard. The database file is
/// deleted when the guard is dropped.
#[cfg(feature = "libsql")]
pub async fn test_db() -> (Arc<dyn Database>, tempfile::TempDir) {
    use crate::db::libsql::LibSqlBackend;

    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("test.db");
    let backend = LibSqlBackend::new_local(&path)
        .await
        .expect("failed to create test LibSqlBackend");
    backend
        .run_migrations()
        .await
        .expect("failed to run migrations");
    (Arc::new(backend) as Arc<dyn Database>, dir)
}

/// A complete item authored by `author_id`, starting its own conversation.
pub fn item(id: &str, author_id: &str, handle: &str, text: &str) -> Item {
    Item {
        id: id.to_string(),
        author_id: author_id.to_string(),
        author_handle: handle.to_string(),
        text: text.to_string(),
        conversation_id: Some(id.to_string()),
        created_at: Utc::now(),
        in_reply_to_item_id: None,
        in_reply_to_user_id: None,
        in_reply_to_handle: None,
    }
}

/// Same as [`item`] with an explicit timestamp.
pub fn item_at(id: &str, author_id: &str, handle: &str, text: &str, at: DateTime<Utc>) -> Item {
    Item {
        created_at: at,
        ..item(id, author_id, handle, text)
    }
}

/// Interaction store whose lookups always fail.
pub struct FailingInteractionStore;

#[async_trait]
impl InteractionStore for FailingInteractionStore {
    async fn count_interactions(
        &self,
        _agent_id: &str,
        _user_id: &str,
        _since: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        Err(DatabaseError::Query("connection reset".to_string()))
    }
}

// ==================== Platform ====================

/// One recorded `send` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SentRecord {
    pub id: String,
    pub text: String,
    pub reply_to: Option<String>,
    pub has_media: bool,
}

/// A scriptable platform client.
///
/// Connects instantly as `@ava` unless told otherwise, reports 1000
/// followers for unknown profiles, and records every send.
pub struct StubPlatform {
    kind: PlatformKind,
    identity: PlatformIdentity,
    ready: AtomicBool,
    connect_delay: Duration,
    failing_connects: AtomicU32,
    connect_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    connects_in_flight: AtomicU32,
    max_concurrent_connects: AtomicU32,
    send_failing: AtomicBool,
    failing_reply_targets: Mutex<HashSet<String>>,
    next_id: AtomicU64,
    sent: Mutex<Vec<SentRecord>>,
    timeline: Mutex<Vec<Item>>,
    mentions: Mutex<Vec<Item>>,
    mention_queries: Mutex<Vec<String>>,
    followers: Mutex<HashMap<String, u64>>,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    incoming_rx: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
}

impl Default for StubPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl StubPlatform {
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(64);
        Self {
            kind: PlatformKind::Twitter,
            identity: PlatformIdentity {
                user_id: "ava-id".to_string(),
                handle: "ava".to_string(),
            },
            ready: AtomicBool::new(false),
            connect_delay: Duration::ZERO,
            failing_connects: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            connects_in_flight: AtomicU32::new(0),
            max_concurrent_connects: AtomicU32::new(0),
            send_failing: AtomicBool::new(false),
            failing_reply_targets: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            sent: Mutex::new(Vec::new()),
            timeline: Mutex::new(Vec::new()),
            mentions: Mutex::new(Vec::new()),
            mention_queries: Mutex::new(Vec::new()),
            followers: Mutex::new(HashMap::new()),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
        }
    }

    pub fn with_kind(mut self, kind: PlatformKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Make the next `n` connects fail with a login error.
    pub fn fail_next_connects(&self, n: u32) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_send_failing(&self, failing: bool) {
        self.send_failing.store(failing, Ordering::SeqCst);
    }

    /// Fail sends that reply to `item_id`.
    pub fn fail_replies_to(&self, item_id: &str) {
        self.failing_reply_targets
            .lock()
            .unwrap()
            .insert(item_id.to_string());
    }

    pub fn set_timeline(&self, items: Vec<Item>) {
        *self.timeline.lock().unwrap() = items;
    }

    pub fn set_mentions(&self, items: Vec<Item>) {
        *self.mentions.lock().unwrap() = items;
    }

    pub fn set_followers(&self, handle: &str, count: u64) {
        self.followers
            .lock()
            .unwrap()
            .insert(handle.to_string(), count);
    }

    /// Queue a chat message for the `subscribe` stream.
    pub fn push_message(&self, message: IncomingMessage) {
        self.incoming_tx
            .try_send(message)
            .expect("stub incoming channel full");
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_connects(&self) -> u32 {
        self.max_concurrent_connects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().unwrap().clone()
    }

    pub fn mention_queries(&self) -> Vec<String> {
        self.mention_queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlatformClient for StubPlatform {
    fn kind(&self) -> PlatformKind {
        self.kind
    }

    async fn connect(&self) -> Result<PlatformIdentity, ConnectionError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.connects_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_connects
            .fetch_max(in_flight, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        self.connects_in_flight.fetch_sub(1, Ordering::SeqCst);

        let should_fail = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(ConnectionError::LoginFailed {
                agent: self.identity.handle.clone(),
                platform: self.kind.to_string(),
                reason: "invalid credentials".to_string(),
            });
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(self.identity.clone())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
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
                platform: self.kind.to_string(),
            });
        }
        let targeted = reply_to.is_some_and(|id| {
            self.failing_reply_targets.lock().unwrap().contains(id)
        });
        if self.send_failing.load(Ordering::SeqCst) || targeted {
            return Err(PlatformError::SendFailed {
                platform: self.kind.to_string(),
                reason: "rejected by stub".to_string(),
            });
        }
        let id = format!("sent-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.sent.lock().unwrap().push(SentRecord {
            id: id.clone(),
            text: text.to_string(),
            reply_to: reply_to.map(str::to_string),
            has_media: media.is_some(),
        });
        Ok(SentItem {
            conversation_id: Some(reply_to.unwrap_or(&id).to_string()),
            id,
            created_at: Utc::now(),
        })
    }

    async fn fetch_timeline(&self, limit: usize) -> Result<Vec<Item>, PlatformError> {
        Ok(self
            .timeline
            .lock()
            .unwrap()
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn search_mentions(&self, query: &str, limit: usize) -> Result<Vec<Item>, PlatformError> {
        self.mention_queries.lock().unwrap().push(query.to_string());
        Ok(self
            .mentions
            .lock()
            .unwrap()
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_profile(&self, handle: &str) -> Result<Profile, PlatformError> {
        let followers_count = self
            .followers
            .lock()
            .unwrap()
            .get(handle)
            .copied()
            .unwrap_or(1000);
        Ok(Profile {
            user_id: format!("{handle}-id"),
            handle: handle.to_string(),
            followers_count,
        })
    }

    async fn subscribe(&self, _capacity: usize) -> Result<Option<MessageStream>, PlatformError> {
        // Twitter has no push channel.
        if self.kind == PlatformKind::Twitter {
            return Ok(None);
        }
        Ok(self
            .incoming_rx
            .lock()
            .unwrap()
            .take()
            .map(|rx| Box::pin(ReceiverStream::new(rx)) as MessageStream))
    }
}

/// Factory handing out one shared [`StubPlatform`] for every platform.
pub struct StubFactory {
    platform: Arc<StubPlatform>,
    created: AtomicU32,
}

impl StubFactory {
    pub fn new(platform: Arc<StubPlatform>) -> Self {
        Self {
            platform,
            created: AtomicU32::new(0),
        }
    }

    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }
}

impl PlatformFactory for StubFactory {
    fn create(
        &self,
        _character: &Character,
        _platform: PlatformKind,
    ) -> Result<Arc<dyn PlatformClient>, ConfigError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.platform) as Arc<dyn PlatformClient>)
    }

    fn supports(&self, _platform: PlatformKind) -> bool {
        true
    }
}

// ==================== Generation ====================

/// One recorded generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub mode: GenerationMode,
    pub input: String,
    pub history: Option<String>,
}

/// Generator returning queued responses, then `stub reply N`.
pub struct StubGenerator {
    calls: AtomicU32,
    should_fail: AtomicBool,
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl Default for StubGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl StubGenerator {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            should_fail: AtomicBool::new(false),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responses<I, S>(self, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.responses.lock().unwrap() = responses.into_iter().map(Into::into).collect();
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.should_fail.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentGenerator for StubGenerator {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<Generation, LlmError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(RecordedRequest {
            mode: request.mode,
            input: request.input.clone(),
            history: request.history.clone(),
        });
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(LlmError::RequestFailed {
                provider: "stub".to_string(),
                reason: "simulated failure".to_string(),
            });
        }
        let content = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| format!("stub reply {n}"));
        Ok(Generation {
            prompt: format!("stub prompt {:?}", request.mode),
            content,
        })
    }
}

/// Media generator that succeeds with a tiny PNG header or fails on demand.
pub struct StubMedia {
    should_fail: AtomicBool,
    calls: AtomicU32,
}

impl StubMedia {
    pub fn new(should_fail: bool) -> Self {
        Self {
            should_fail: AtomicBool::new(should_fail),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaGenerator for StubMedia {
    async fn generate_media(&self, _character: &Character, _text: &str) -> Result<Media, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(LlmError::RequestFailed {
                provider: "stub-media".to_string(),
                reason: "simulated failure".to_string(),
            });
        }
        Ok(Media {
            mime_type: "image/png".to_string(),
            data: vec![0x89, b'P', b'N', b'G'],
        })
    }
}

// ==================== Embeddings ====================

/// Bag-of-words hashing embedder. Identical texts map to identical
/// vectors; texts sharing no words are orthogonal unless buckets collide.
pub struct HashEmbeddings {
    dimension: usize,
    fail: bool,
}

impl HashEmbeddings {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            dimension: 8,
            fail: true,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddings {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "hash"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.fail {
            return Err(EmbeddingError::RequestFailed {
                reason: "simulated failure".to_string(),
            });
        }
        let mut vector = vec![0.0f32; self.dimension];
        for word in text.split_whitespace() {
            let hash = word
                .to_lowercase()
                .bytes()
                .fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
                    (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
                });
            vector[(hash % self.dimension as u64) as usize] += 1.0;
        }
        Ok(vector)
    }
}

/// Similarity checker with scripted verdicts.
pub struct StubSimilarity {
    verdicts: Mutex<VecDeque<bool>>,
    default: bool,
    checks: AtomicU32,
}

impl StubSimilarity {
    pub fn always(similar: bool) -> Self {
        Self {
            verdicts: Mutex::new(VecDeque::new()),
            default: similar,
            checks: AtomicU32::new(0),
        }
    }

    /// Return `verdicts` in order, then "not similar".
    pub fn sequence(verdicts: Vec<bool>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            default: false,
            checks: AtomicU32::new(0),
        }
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SimilarityCheck for StubSimilarity {
    async fn is_too_similar(&self, _agent_id: &str, _text: &str) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default)
    }
}
