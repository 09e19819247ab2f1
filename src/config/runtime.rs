use std::time::Duration;

use crate::config::helpers::{parse_optional_env, parse_secs_env};
use crate::error::ConfigError;

/// Tuning knobs for the scheduling and anti-abuse layers.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Max interactions with one remote user inside `interaction_window`.
    pub interaction_limit: u64,
    pub interaction_window: Duration,
    /// Generations tried before a topic post tick gives up.
    pub novelty_max_attempts: u32,
    /// Cosine similarity at or above which a candidate counts as a repeat.
    pub novelty_threshold: f32,
    /// Nearest stored posts compared against each candidate.
    pub novelty_top_k: usize,
    /// Pause before replying to each mention.
    pub mention_reply_delay: Duration,
    /// Consecutive failed ticks before a mode stops itself.
    pub max_consecutive_failures: u32,
    pub timeline_limit: usize,
    pub mention_limit: usize,
    /// Mentions from accounts with fewer followers are ignored.
    pub min_follower_count: u64,
    /// Items per side (agent, remote user) included as reply context.
    pub history_limit: usize,
    pub chat_history_limit: usize,
    /// Capacity of the bounded incoming-message channel per platform.
    pub chat_channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interaction_limit: 3,
            interaction_window: Duration::from_secs(60 * 60),
            novelty_max_attempts: 3,
            novelty_threshold: 0.5,
            novelty_top_k: 5,
            mention_reply_delay: Duration::from_secs(15),
            max_consecutive_failures: 3,
            timeline_limit: 50,
            mention_limit: 10,
            min_follower_count: 50,
            history_limit: 10,
            chat_history_limit: 20,
            chat_channel_capacity: 64,
        }
    }
}

impl RuntimeConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            interaction_limit: parse_optional_env("INTERACTION_LIMIT", defaults.interaction_limit)?,
            interaction_window: parse_secs_env(
                "INTERACTION_WINDOW_SECS",
                defaults.interaction_window,
            )?,
            novelty_max_attempts: parse_optional_env(
                "NOVELTY_MAX_ATTEMPTS",
                defaults.novelty_max_attempts,
            )?,
            novelty_threshold: parse_optional_env("NOVELTY_THRESHOLD", defaults.novelty_threshold)?,
            novelty_top_k: parse_optional_env("NOVELTY_TOP_K", defaults.novelty_top_k)?,
            mention_reply_delay: parse_secs_env(
                "MENTION_REPLY_DELAY_SECS",
                defaults.mention_reply_delay,
            )?,
            max_consecutive_failures: parse_optional_env(
                "MAX_CONSECUTIVE_TICK_FAILURES",
                defaults.max_consecutive_failures,
            )?,
            timeline_limit: parse_optional_env("TIMELINE_FETCH_LIMIT", defaults.timeline_limit)?,
            mention_limit: parse_optional_env("MENTION_FETCH_LIMIT", defaults.mention_limit)?,
            min_follower_count: parse_optional_env(
                "MENTION_MIN_FOLLOWERS",
                defaults.min_follower_count,
            )?,
            history_limit: parse_optional_env("REPLY_HISTORY_LIMIT", defaults.history_limit)?,
            chat_history_limit: parse_optional_env(
                "CHAT_HISTORY_LIMIT",
                defaults.chat_history_limit,
            )?,
            chat_channel_capacity: parse_optional_env(
                "CHAT_CHANNEL_CAPACITY",
                defaults.chat_channel_capacity,
            )?,
        };

        if config.novelty_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NOVELTY_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&config.novelty_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "NOVELTY_THRESHOLD".to_string(),
                message: format!("must be within 0..=1, got {}", config.novelty_threshold),
            });
        }
        if config.chat_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_CHANNEL_CAPACITY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(config)
    }
}
