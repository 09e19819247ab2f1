//! Integration tests for the agent runtime.
//!
//! Runs sessions end to end against a temporary libSQL database and the
//! scriptable stub platform.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use secrecy::SecretString;

use persona_runtime::agent::{
    AgentDeps, AgentRuntime, ConnectionLifecycle, ConnectionRegistry, Mode, StartOutcome,
};
use persona_runtime::character::{Character, PlatformKind};
use persona_runtime::config::RuntimeConfig;
use persona_runtime::db::ItemStore;
use persona_runtime::platform::PlatformClient;
use persona_runtime::testing::{StubFactory, StubGenerator, StubPlatform, item_at, test_db};

fn ava() -> Character {
    let mut c = Character::new("Ava", "ava");
    c.credentials.twitter_password = Some(SecretString::from("pw".to_string()));
    c
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_connect_once() {
    let platform =
        Arc::new(StubPlatform::new().with_connect_delay(Duration::from_millis(50)));
    let registry = Arc::new(ConnectionRegistry::new());
    let lifecycle = Arc::new(ConnectionLifecycle::new(
        "twitter:ava",
        platform.clone() as Arc<dyn PlatformClient>,
        Arc::clone(&registry),
    ));

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let lifecycle = Arc::clone(&lifecycle);
        tasks.push(tokio::spawn(async move { lifecycle.start().await }));
    }
    let mut connected = 0;
    for task in tasks {
        match task.await.expect("task panicked").expect("start failed") {
            StartOutcome::Connected(_) => connected += 1,
            StartOutcome::AlreadyActive => {}
        }
    }

    assert_eq!(connected, 1);
    assert_eq!(platform.connect_calls(), 1);
    assert_eq!(platform.max_concurrent_connects(), 1);
    assert_eq!(registry.list_active().await, vec!["twitter:ava"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiter_retries_after_failed_connect() {
    let platform =
        Arc::new(StubPlatform::new().with_connect_delay(Duration::from_millis(30)));
    platform.fail_next_connects(1);
    let registry = Arc::new(ConnectionRegistry::new());
    let lifecycle = Arc::new(ConnectionLifecycle::new(
        "twitter:ava",
        platform.clone() as Arc<dyn PlatformClient>,
        Arc::clone(&registry),
    ));

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let lifecycle = Arc::clone(&lifecycle);
        tasks.push(tokio::spawn(async move { lifecycle.start().await }));
    }
    let mut failures = 0;
    for task in tasks {
        if task.await.expect("task panicked").is_err() {
            failures += 1;
        }
    }

    assert_eq!(failures, 1);
    assert_eq!(platform.connect_calls(), 2);
    assert!(registry.is_active("twitter:ava").await);
}

#[tokio::test]
async fn test_dropped_connection_is_reconciled() {
    let platform = Arc::new(StubPlatform::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let lifecycle = ConnectionLifecycle::new(
        "twitter:ava",
        platform.clone() as Arc<dyn PlatformClient>,
        Arc::clone(&registry),
    );

    lifecycle.start().await.expect("connect");
    assert!(lifecycle.is_active().await);

    // Connection drops underneath us.
    platform.set_ready(false);
    assert!(!lifecycle.is_active().await);
    assert!(!registry.is_active("twitter:ava").await);

    // The next start reconnects.
    assert!(matches!(
        lifecycle.start().await.expect("reconnect"),
        StartOutcome::Connected(_)
    ));
    assert_eq!(platform.connect_calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_runtime_modes_share_one_connection() {
    let (store, _dir) = test_db().await;
    let platform =
        Arc::new(StubPlatform::new().with_connect_delay(Duration::from_millis(30)));
    let deps = AgentDeps::new(store, Arc::new(StubGenerator::new()), RuntimeConfig::default());
    let runtime = Arc::new(AgentRuntime::new(
        vec![ava()],
        Arc::new(StubFactory::new(platform.clone())),
        deps,
    ));

    let mut tasks = Vec::new();
    for mode in [Mode::TopicPost, Mode::AutoResponse] {
        let runtime = Arc::clone(&runtime);
        tasks.push(tokio::spawn(async move {
            runtime.start("ava", PlatformKind::Twitter, mode).await
        }));
    }
    for task in tasks {
        task.await.expect("task panicked").expect("start failed");
    }

    assert_eq!(platform.connect_calls(), 1);
    let status = runtime.status("ava", PlatformKind::Twitter).await;
    assert!(status.is_active);
    assert_eq!(status.modes.iter().filter(|m| m.active).count(), 2);

    runtime.shutdown().await;
    assert!(runtime.list_active().await.is_empty());
    assert_eq!(platform.disconnect_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_mention_mode_end_to_end() {
    let (store, _dir) = test_db().await;
    let platform = Arc::new(StubPlatform::new());
    let now = Utc::now();
    platform.set_mentions(vec![
        item_at("m1", "u1", "alice", "@ava what do you think?", now - ChronoDuration::minutes(3)),
        item_at("m2", "u2", "bob", "@ava hello", now - ChronoDuration::minutes(1)),
    ]);
    let generator = Arc::new(StubGenerator::new());
    let deps = AgentDeps::new(store.clone(), generator.clone(), RuntimeConfig::default());
    let runtime = AgentRuntime::new(vec![ava()], Arc::new(StubFactory::new(platform.clone())), deps);

    runtime
        .start("ava", PlatformKind::Twitter, Mode::MentionReply)
        .await
        .expect("start");

    // Two mentions, 15 s apart.
    tokio::time::sleep(Duration::from_secs(40)).await;

    let sent = platform.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].reply_to.as_deref(), Some("m1"));
    assert_eq!(sent[1].reply_to.as_deref(), Some("m2"));

    for (mention, reply) in [("m1", &sent[0]), ("m2", &sent[1])] {
        assert!(store.get_item("twitter:ava", mention).await.unwrap().is_some());
        let stored = store
            .get_item("twitter:ava", &reply.id)
            .await
            .unwrap()
            .expect("reply stored");
        assert_eq!(stored.in_reply_to_item_id.as_deref(), Some(mention));
        assert!(store.get_prompt(&reply.id).await.unwrap().is_some());
    }

    // The next run sees both mentions as processed.
    tokio::time::sleep(Duration::from_secs(15 * 60)).await;
    assert_eq!(platform.sent().len(), 2);
    assert_eq!(platform.mention_queries().len(), 2);

    let report = runtime.stop("ava", PlatformKind::Twitter, Mode::MentionReply).await;
    assert!(report.stopped);
    runtime.shutdown().await;
}
