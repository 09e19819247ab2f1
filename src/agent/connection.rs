//! Platform connection lifecycle.
//!
//! At most one live connection may exist per agent key across the whole
//! process. [`ConnectionRegistry`] is the shared record of which keys are
//! live plus a pool of per-key mutexes that serialize connect attempts;
//! [`ConnectionLifecycle`] drives one agent's `Idle -> Connecting -> Active`
//! state machine against it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::ConnectionError;
use crate::platform::{PlatformClient, PlatformIdentity};

/// Local state of one agent's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Active,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Process-wide record of live connections, shared by every session.
#[derive(Default)]
pub struct ConnectionRegistry {
    active: RwLock<HashSet<String>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_active(&self, key: &str) -> bool {
        self.active.read().await.contains(key)
    }

    /// All keys currently marked active, sorted.
    pub async fn list_active(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.active.read().await.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether a connect attempt (or its liveness marker) is held for `key`.
    pub async fn has_lock(&self, key: &str) -> bool {
        self.locks.lock().await.contains_key(key)
    }

    async fn mark_active(&self, key: &str) {
        self.active.write().await.insert(key.to_string());
    }

    async fn mark_inactive(&self, key: &str) -> bool {
        self.active.write().await.remove(key)
    }

    /// Drop every trace of `key`. Returns whether anything was registered.
    async fn remove(&self, key: &str) -> bool {
        let was_active = self.mark_inactive(key).await;
        let had_lock = self.locks.lock().await.remove(key).is_some();
        was_active || had_lock
    }

    /// Take the attempt lock for `key`, waiting for an in-flight attempt.
    ///
    /// If the attempt we waited on failed, its entry was removed from the
    /// pool while we queued on it; in that case we queue again on the fresh
    /// entry so that only one attempt is ever in flight.
    async fn acquire_attempt(&self, key: &str) -> OwnedMutexGuard<()> {
        loop {
            let lock = {
                let mut locks = self.locks.lock().await;
                Arc::clone(
                    locks
                        .entry(key.to_string())
                        .or_insert_with(|| Arc::new(Mutex::new(()))),
                )
            };
            let guard = Arc::clone(&lock).lock_owned().await;

            let current = self
                .locks
                .lock()
                .await
                .get(key)
                .is_some_and(|entry| Arc::ptr_eq(entry, &lock));
            if current {
                return guard;
            }
        }
    }

    async fn release_attempt(&self, key: &str) {
        self.locks.lock().await.remove(key);
    }
}

/// Outcome of [`ConnectionLifecycle::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// This call performed the connect.
    Connected(PlatformIdentity),
    /// The agent was already live (possibly connected by a concurrent call).
    AlreadyActive,
}

/// Outcome of [`ConnectionLifecycle::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// False when nothing was connected or registered.
    pub torn_down: bool,
}

struct LocalState {
    status: ConnectionStatus,
    identity: Option<PlatformIdentity>,
}

/// One agent's connection to one platform.
pub struct ConnectionLifecycle {
    agent_key: String,
    platform: Arc<dyn PlatformClient>,
    registry: Arc<ConnectionRegistry>,
    state: Mutex<LocalState>,
}

impl ConnectionLifecycle {
    pub fn new(
        agent_key: impl Into<String>,
        platform: Arc<dyn PlatformClient>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            agent_key: agent_key.into(),
            platform,
            registry,
            state: Mutex::new(LocalState {
                status: ConnectionStatus::Idle,
                identity: None,
            }),
        }
    }

    pub fn agent_key(&self) -> &str {
        &self.agent_key
    }

    pub fn platform(&self) -> &Arc<dyn PlatformClient> {
        &self.platform
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status
    }

    pub async fn identity(&self) -> Option<PlatformIdentity> {
        self.state.lock().await.identity.clone()
    }

    /// Ensure a live connection.
    ///
    /// Idempotent: returns `AlreadyActive` when the registry already marks
    /// this agent live. Concurrent callers queue on the per-key lock and
    /// observe the first caller's success; after a failure the next queued
    /// caller makes its own attempt.
    pub async fn start(&self) -> Result<StartOutcome, ConnectionError> {
        if self.registry.is_active(&self.agent_key).await {
            tracing::debug!(agent = %self.agent_key, "Connection already active");
            return Ok(StartOutcome::AlreadyActive);
        }

        let _attempt = self.registry.acquire_attempt(&self.agent_key).await;

        if self.registry.is_active(&self.agent_key).await {
            tracing::debug!(agent = %self.agent_key, "Connection became active while waiting");
            return Ok(StartOutcome::AlreadyActive);
        }

        self.state.lock().await.status = ConnectionStatus::Connecting;
        tracing::info!(agent = %self.agent_key, platform = %self.platform.kind(), "Connecting");

        match self.platform.connect().await {
            Ok(identity) => {
                self.registry.mark_active(&self.agent_key).await;
                let mut state = self.state.lock().await;
                state.status = ConnectionStatus::Active;
                state.identity = Some(identity.clone());
                tracing::info!(
                    agent = %self.agent_key,
                    handle = %identity.handle,
                    "Connection active"
                );
                Ok(StartOutcome::Connected(identity))
            }
            Err(e) => {
                self.state.lock().await.status = ConnectionStatus::Failed;
                self.registry.release_attempt(&self.agent_key).await;
                tracing::warn!(agent = %self.agent_key, error = %e, "Connection attempt failed");
                Err(e)
            }
        }
    }

    /// Tear down the connection.
    ///
    /// Registry entries are removed first regardless of local state so a
    /// drifted registry is always cleaned. Safe to call when nothing was
    /// ever started. A failing platform disconnect is logged, not returned.
    pub async fn stop(&self) -> StopOutcome {
        let was_registered = self.registry.remove(&self.agent_key).await;

        let mut state = self.state.lock().await;
        let had_local = state.status == ConnectionStatus::Active;
        if had_local || self.platform.is_ready() {
            if let Err(e) = self.platform.disconnect().await {
                tracing::warn!(agent = %self.agent_key, error = %e, "Disconnect failed");
            }
        }
        state.status = ConnectionStatus::Idle;
        state.identity = None;

        let torn_down = was_registered || had_local;
        if torn_down {
            tracing::info!(agent = %self.agent_key, "Connection stopped");
        }
        StopOutcome { torn_down }
    }

    /// Whether this agent is live, reconciling the registry if it disagrees.
    ///
    /// The local view (`Active` and the platform reports ready) wins. A
    /// connection that dropped without going through `stop` is downgraded
    /// to `Idle` so the next `start` reconnects.
    pub async fn is_active(&self) -> bool {
        let mut state = self.state.lock().await;
        let ready = self.platform.is_ready();
        let local = state.status == ConnectionStatus::Active && ready;
        if state.status == ConnectionStatus::Active && !ready {
            state.status = ConnectionStatus::Idle;
            state.identity = None;
        }
        drop(state);

        let global = self.registry.is_active(&self.agent_key).await;
        if local != global {
            tracing::warn!(
                agent = %self.agent_key,
                local,
                global,
                "Connection registry out of sync, reconciling"
            );
            if local {
                self.registry.mark_active(&self.agent_key).await;
            } else {
                self.registry.remove(&self.agent_key).await;
            }
        }
        local
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::StubPlatform;

    fn lifecycle(
        platform: Arc<StubPlatform>,
        registry: Arc<ConnectionRegistry>,
    ) -> ConnectionLifecycle {
        ConnectionLifecycle::new("console:ava", platform, registry)
    }

    #[tokio::test]
    async fn concurrent_start_connects_once() {
        let platform = Arc::new(StubPlatform::new().with_connect_delay(Duration::from_millis(50)));
        let registry = Arc::new(ConnectionRegistry::new());
        let conn = lifecycle(Arc::clone(&platform), Arc::clone(&registry));

        let (a, b) = tokio::join!(conn.start(), conn.start());
        let outcomes = [a.unwrap(), b.unwrap()];

        let connected = outcomes
            .iter()
            .filter(|o| matches!(o, StartOutcome::Connected(_)))
            .count();
        assert_eq!(connected, 1);
        assert!(outcomes.contains(&StartOutcome::AlreadyActive));
        assert_eq!(platform.connect_calls(), 1);
        assert_eq!(registry.list_active().await, vec!["console:ava".to_string()]);
        assert_eq!(conn.status().await, ConnectionStatus::Active);
    }

    #[tokio::test]
    async fn two_lifecycles_same_key_share_one_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let p1 = Arc::new(StubPlatform::new().with_connect_delay(Duration::from_millis(20)));
        let p2 = Arc::new(StubPlatform::new());
        let c1 = lifecycle(Arc::clone(&p1), Arc::clone(&registry));
        let c2 = lifecycle(Arc::clone(&p2), Arc::clone(&registry));

        let (a, b) = tokio::join!(c1.start(), c2.start());
        a.unwrap();
        b.unwrap();
        assert_eq!(p1.connect_calls() + p2.connect_calls(), 1);
        assert_eq!(registry.list_active().await.len(), 1);
    }

    #[tokio::test]
    async fn stop_when_never_started_is_safe() {
        let platform = Arc::new(StubPlatform::new());
        let conn = lifecycle(Arc::clone(&platform), Arc::new(ConnectionRegistry::new()));

        let outcome = conn.stop().await;
        assert!(!outcome.torn_down);
        assert_eq!(platform.disconnect_calls(), 0);
        assert_eq!(conn.status().await, ConnectionStatus::Idle);

        assert!(!conn.stop().await.torn_down);
    }

    #[tokio::test]
    async fn stop_after_start_tears_down() {
        let platform = Arc::new(StubPlatform::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let conn = lifecycle(Arc::clone(&platform), Arc::clone(&registry));

        conn.start().await.unwrap();
        assert!(registry.has_lock("console:ava").await);

        let outcome = conn.stop().await;
        assert!(outcome.torn_down);
        assert_eq!(platform.disconnect_calls(), 1);
        assert!(registry.list_active().await.is_empty());
        assert!(!registry.has_lock("console:ava").await);
        assert!(!conn.is_active().await);
    }

    #[tokio::test]
    async fn failed_connect_releases_lock_and_allows_retry() {
        let platform = Arc::new(StubPlatform::new());
        platform.fail_next_connects(1);
        let registry = Arc::new(ConnectionRegistry::new());
        let conn = lifecycle(Arc::clone(&platform), Arc::clone(&registry));

        let err = conn.start().await.unwrap_err();
        assert!(matches!(err, ConnectionError::LoginFailed { .. }));
        assert_eq!(conn.status().await, ConnectionStatus::Failed);
        assert!(!registry.has_lock("console:ava").await);
        assert!(registry.list_active().await.is_empty());

        let outcome = conn.start().await.unwrap();
        assert!(matches!(outcome, StartOutcome::Connected(_)));
        assert_eq!(platform.connect_calls(), 2);
    }

    #[tokio::test]
    async fn waiter_retries_after_failed_attempt() {
        let platform = Arc::new(StubPlatform::new().with_connect_delay(Duration::from_millis(20)));
        platform.fail_next_connects(1);
        let conn = lifecycle(Arc::clone(&platform), Arc::new(ConnectionRegistry::new()));

        let (a, b) = tokio::join!(conn.start(), conn.start());
        assert!(a.is_err() != b.is_err(), "exactly one attempt should fail");
        assert_eq!(platform.connect_calls(), 2);
        assert_eq!(platform.max_concurrent_connects(), 1);
        assert!(conn.is_active().await);
    }

    #[tokio::test]
    async fn is_active_reconciles_dropped_connection() {
        let platform = Arc::new(StubPlatform::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let conn = lifecycle(Arc::clone(&platform), Arc::clone(&registry));
        conn.start().await.unwrap();

        // Connection dropped underneath us without a stop().
        platform.set_ready(false);
        assert!(!conn.is_active().await);
        assert!(registry.list_active().await.is_empty());
        assert_eq!(conn.status().await, ConnectionStatus::Idle);

        // A later start reconnects.
        platform.set_ready(true);
        assert!(matches!(
            conn.start().await.unwrap(),
            StartOutcome::Connected(_)
        ));
    }

    #[tokio::test]
    async fn is_active_restores_missing_registry_entry() {
        let platform = Arc::new(StubPlatform::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let conn = lifecycle(Arc::clone(&platform), Arc::clone(&registry));
        conn.start().await.unwrap();

        registry.remove("console:ava").await;
        assert!(conn.is_active().await);
        assert_eq!(registry.list_active().await, vec!["console:ava".to_string()]);
    }
}
