//! Per-user interaction throttling.
//!
//! Counts the agent's stored replies to one remote user inside a sliding
//! window. A failed lookup counts as zero interactions, so a storage hiccup
//! never silences an agent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::db::InteractionStore;

pub struct InteractionThrottle {
    store: Arc<dyn InteractionStore>,
}

impl InteractionThrottle {
    pub fn new(store: Arc<dyn InteractionStore>) -> Self {
        Self { store }
    }

    /// Replies by `agent_id` to `user_id` newer than `now - window`.
    pub async fn count_within(&self, agent_id: &str, user_id: &str, window: Duration) -> u64 {
        let window = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let since = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        match self.store.count_interactions(agent_id, user_id, since).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(
                    agent = agent_id,
                    user = user_id,
                    error = %e,
                    "Interaction lookup failed, treating as no interactions"
                );
                0
            }
        }
    }

    /// Whether the agent may engage `user_id` again.
    pub async fn allow(&self, agent_id: &str, user_id: &str, window: Duration, limit: u64) -> bool {
        self.count_within(agent_id, user_id, window).await < limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ItemStore;
    use crate::testing::{FailingInteractionStore, item, test_db};

    const HOUR: Duration = Duration::from_secs(3600);

    async fn seed_reply(db: &dyn ItemStore, id: &str, to: &str, age: chrono::Duration) {
        let mut reply = item(id, "ava-id", "ava", "reply");
        reply.in_reply_to_user_id = Some(to.to_string());
        reply.created_at = Utc::now() - age;
        db.save_item("ava", &reply).await.unwrap();
    }

    #[tokio::test]
    async fn counts_only_inside_window() {
        let (db, _dir) = test_db().await;
        seed_reply(db.as_ref(), "r1", "u1", chrono::Duration::hours(1)).await;
        seed_reply(db.as_ref(), "r2", "u1", chrono::Duration::hours(3)).await;
        seed_reply(db.as_ref(), "r3", "u2", chrono::Duration::minutes(5)).await;

        let throttle = InteractionThrottle::new(db);
        assert_eq!(throttle.count_within("ava", "u1", 2 * HOUR).await, 1);
        assert_eq!(throttle.count_within("ava", "u1", 4 * HOUR).await, 2);
        assert_eq!(throttle.count_within("bob", "u1", 4 * HOUR).await, 0);
    }

    #[tokio::test]
    async fn allow_is_strictly_below_limit() {
        let (db, _dir) = test_db().await;
        for i in 0..3 {
            seed_reply(db.as_ref(), &format!("r{i}"), "u1", chrono::Duration::minutes(10)).await;
        }
        let throttle = InteractionThrottle::new(db);
        assert!(!throttle.allow("ava", "u1", HOUR, 3).await);
        assert!(throttle.allow("ava", "u1", HOUR, 4).await);
        assert!(throttle.allow("ava", "u2", HOUR, 3).await);
    }

    #[tokio::test]
    async fn lookup_failure_counts_as_zero() {
        let throttle = InteractionThrottle::new(Arc::new(FailingInteractionStore));
        assert_eq!(throttle.count_within("ava", "u1", HOUR).await, 0);
        assert!(throttle.allow("ava", "u1", HOUR, 1).await);
    }
}
