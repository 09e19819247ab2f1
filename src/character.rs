//! Character (persona) definitions.
//!
//! Characters are loaded from a JSON array. Platform credentials are never
//! stored in that file; they are attached from the environment at load
//! time and checked when a session for a platform is created.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::agent::{Mode, ScheduleBounds};
use crate::config::helpers::optional_env;
use crate::error::ConfigError;

const MINUTE_MS: u64 = 60 * 1000;

/// Platforms an agent can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Twitter,
    Discord,
    Telegram,
    Console,
}

impl PlatformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Twitter => "twitter",
            Self::Discord => "discord",
            Self::Telegram => "telegram",
            Self::Console => "console",
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "twitter" | "x" => Ok(Self::Twitter),
            "discord" => Ok(Self::Discord),
            "telegram" => Ok(Self::Telegram),
            "console" | "cli" => Ok(Self::Console),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}

/// Posting behaviour knobs from the character file.
///
/// Interval fields are milliseconds; bound fields are minutes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostingBehavior {
    pub reply_interval: Option<u64>,
    pub topic_interval: Option<u64>,
    pub lower_bound_posting_interval: Option<u64>,
    pub upper_bound_posting_interval: Option<u64>,
    pub remove_periods: bool,
    pub only_keep_first_sentence: bool,
    /// Handles the agent never replies to.
    pub dont_tweet_at: Vec<String>,
    pub chat_mode_rules: Vec<String>,
    pub chat_mode_model: Option<String>,
    pub should_ignore_twitter_replies: bool,
    pub generate_image_prompt: bool,
    pub image_prompt_chance: Option<f64>,
}

impl PostingBehavior {
    /// Scheduling window for a mode.
    ///
    /// Topic posts default to 45 minutes +/- 30. Auto-responses use
    /// `replyInterval` exactly when set, otherwise 15 minutes +/- 60 with the
    /// lower side clamped at zero. Mention replies run every 10 minutes +/- 2.
    ///
    /// An explicit bound of 0 pins a topic post window to its center, while
    /// the reply modes treat 0 as unset and use their default bound.
    pub fn bounds_for(&self, mode: Mode) -> ScheduleBounds {
        match mode {
            Mode::TopicPost => {
                let center = self.topic_interval.unwrap_or(45 * MINUTE_MS);
                self.around(center, 30, false)
            }
            Mode::AutoResponse => match self.reply_interval {
                Some(exact) => ScheduleBounds::from_millis(exact, exact),
                None => self.around(15 * MINUTE_MS, 60, true),
            },
            Mode::MentionReply => self.around(10 * MINUTE_MS, 2, true),
        }
    }

    fn around(&self, center_ms: u64, default_bound_minutes: u64, zero_is_unset: bool) -> ScheduleBounds {
        let bound = |value: Option<u64>| match value {
            Some(0) if zero_is_unset => default_bound_minutes,
            Some(minutes) => minutes,
            None => default_bound_minutes,
        };
        let lower = bound(self.lower_bound_posting_interval);
        let upper = bound(self.upper_bound_posting_interval);
        ScheduleBounds::from_millis(
            center_ms.saturating_sub(lower.saturating_mul(MINUTE_MS)),
            center_ms.saturating_add(upper.saturating_mul(MINUTE_MS)),
        )
    }

    /// Probability of attaching generated media to a topic post.
    pub fn image_chance(&self) -> f64 {
        if !self.generate_image_prompt {
            return 0.0;
        }
        self.image_prompt_chance.unwrap_or(0.3).clamp(0.0, 1.0)
    }

    pub fn is_muted(&self, handle: &str) -> bool {
        self.dont_tweet_at
            .iter()
            .any(|h| h.trim_start_matches('@').eq_ignore_ascii_case(handle.trim_start_matches('@')))
    }
}

/// Platform secrets, attached from env vars after the file is parsed.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub twitter_password: Option<SecretString>,
    pub twitter_email: Option<String>,
    pub telegram_api_key: Option<SecretString>,
    pub discord_api_key: Option<SecretString>,
}

impl Credentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            twitter_password: optional_env("AGENT_TWITTER_PASSWORD")?.map(SecretString::from),
            twitter_email: optional_env("AGENT_TWITTER_EMAIL")?,
            telegram_api_key: optional_env("AGENT_TELEGRAM_API_KEY")?.map(SecretString::from),
            discord_api_key: optional_env("AGENT_DISCORD_API_KEY")?.map(SecretString::from),
        })
    }
}

/// A configured persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub agent_name: String,
    /// Platform handle, lowercase.
    pub username: String,
    #[serde(default)]
    pub user_id_str: String,
    #[serde(default)]
    pub bio: Vec<String>,
    #[serde(default)]
    pub lore: Vec<String>,
    #[serde(default)]
    pub post_directions: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub adjectives: Vec<String>,
    #[serde(default)]
    pub knowledge: Vec<String>,
    #[serde(default)]
    pub telegram_bot_username: Option<String>,
    #[serde(default)]
    pub discord_bot_username: Option<String>,
    #[serde(default)]
    pub posting_behavior: PostingBehavior,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(skip)]
    pub credentials: Credentials,
}

fn default_temperature() -> f32 {
    0.8
}

impl Character {
    /// Minimal character for tests and the console demo.
    pub fn new(agent_name: impl Into<String>, username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            agent_name: agent_name.into(),
            user_id_str: format!("{username}-id"),
            username,
            bio: Vec::new(),
            lore: Vec::new(),
            post_directions: Vec::new(),
            topics: Vec::new(),
            adjectives: Vec::new(),
            knowledge: Vec::new(),
            telegram_bot_username: None,
            discord_bot_username: None,
            posting_behavior: PostingBehavior::default(),
            model: None,
            fallback_model: None,
            temperature: default_temperature(),
            credentials: Credentials::default(),
        }
    }

    /// Key used for connection registry and storage rows.
    pub fn agent_key(&self, platform: PlatformKind) -> String {
        format!("{}:{}", platform, self.username)
    }

    /// Fail when the platform's secrets are missing.
    ///
    /// Called before a session is created so that a misconfigured agent
    /// never reaches the connection layer.
    pub fn require_credentials(&self, platform: PlatformKind) -> Result<(), ConfigError> {
        let missing = |vars: &str| ConfigError::MissingCredentials {
            agent: self.username.clone(),
            platform: platform.to_string(),
            vars: vars.to_string(),
        };
        match platform {
            PlatformKind::Twitter if self.credentials.twitter_password.is_none() => {
                Err(missing("AGENT_TWITTER_PASSWORD"))
            }
            PlatformKind::Telegram if self.credentials.telegram_api_key.is_none() => {
                Err(missing("AGENT_TELEGRAM_API_KEY"))
            }
            PlatformKind::Discord if self.credentials.discord_api_key.is_none() => {
                Err(missing("AGENT_DISCORD_API_KEY"))
            }
            _ => Ok(()),
        }
    }

    /// Model for a generation, honouring the chat-mode override.
    pub fn model_for(&self, chat: bool, default_model: &str) -> String {
        if chat && let Some(model) = &self.posting_behavior.chat_mode_model {
            return model.clone();
        }
        self.model.clone().unwrap_or_else(|| default_model.to_string())
    }
}

/// Parse a characters file and attach env credentials to each entry.
pub fn load_characters(path: &Path) -> Result<Vec<Character>, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let mut characters = parse_characters(&raw)?;
    let credentials = Credentials::from_env()?;
    for character in &mut characters {
        character.credentials = credentials.clone();
    }
    tracing::info!(
        count = characters.len(),
        path = %path.display(),
        twitter = credentials.twitter_password.is_some(),
        telegram = credentials.telegram_api_key.is_some(),
        discord = credentials.discord_api_key.is_some(),
        "Loaded characters"
    );
    Ok(characters)
}

pub(crate) fn parse_characters(raw: &str) -> Result<Vec<Character>, ConfigError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    if !value.is_array() {
        return Err(ConfigError::ParseError(
            "characters file must contain an array of character configurations".to_string(),
        ));
    }
    serde_json::from_value(value).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Find a character by username or agent name, ignoring case.
pub fn find_character<'a>(characters: &'a [Character], name: &str) -> Option<&'a Character> {
    characters.iter().find(|c| {
        c.username.eq_ignore_ascii_case(name) || c.agent_name.eq_ignore_ascii_case(name)
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn minutes(n: u64) -> Duration {
        Duration::from_millis(n * MINUTE_MS)
    }

    #[test]
    fn topic_bounds_default_to_45_plus_minus_30() {
        let bounds = PostingBehavior::default().bounds_for(Mode::TopicPost);
        assert_eq!(bounds.lower(), minutes(15));
        assert_eq!(bounds.upper(), minutes(75));
    }

    #[test]
    fn reply_interval_pins_auto_response_bounds() {
        let behavior = PostingBehavior {
            reply_interval: Some(120_000),
            ..Default::default()
        };
        let bounds = behavior.bounds_for(Mode::AutoResponse);
        assert_eq!(bounds.lower(), Duration::from_millis(120_000));
        assert_eq!(bounds.upper(), Duration::from_millis(120_000));
    }

    #[test]
    fn auto_response_lower_bound_clamps_at_zero() {
        let bounds = PostingBehavior::default().bounds_for(Mode::AutoResponse);
        assert_eq!(bounds.lower(), Duration::ZERO);
        assert_eq!(bounds.upper(), minutes(75));
    }

    #[test]
    fn mention_bounds_use_configured_minutes() {
        let behavior = PostingBehavior {
            lower_bound_posting_interval: Some(5),
            upper_bound_posting_interval: Some(1),
            ..Default::default()
        };
        let bounds = behavior.bounds_for(Mode::MentionReply);
        assert_eq!(bounds.lower(), minutes(5));
        assert_eq!(bounds.upper(), minutes(11));
    }

    #[test]
    fn zero_bound_pins_topic_but_defaults_for_replies() {
        let behavior = PostingBehavior {
            topic_interval: Some(60_000),
            lower_bound_posting_interval: Some(0),
            upper_bound_posting_interval: Some(0),
            ..Default::default()
        };
        let topic = behavior.bounds_for(Mode::TopicPost);
        assert_eq!(topic.lower(), minutes(1));
        assert_eq!(topic.upper(), minutes(1));

        let mentions = behavior.bounds_for(Mode::MentionReply);
        assert_eq!(mentions.lower(), minutes(8));
        assert_eq!(mentions.upper(), minutes(12));
        let auto = behavior.bounds_for(Mode::AutoResponse);
        assert_eq!(auto.upper(), minutes(75));
    }

    #[test]
    fn image_chance_requires_opt_in() {
        let mut behavior = PostingBehavior {
            image_prompt_chance: Some(0.9),
            ..Default::default()
        };
        assert_eq!(behavior.image_chance(), 0.0);
        behavior.generate_image_prompt = true;
        assert_eq!(behavior.image_chance(), 0.9);
        behavior.image_prompt_chance = None;
        assert_eq!(behavior.image_chance(), 0.3);
    }

    #[test]
    fn muted_handles_ignore_at_and_case() {
        let behavior = PostingBehavior {
            dont_tweet_at: vec!["@SomeBrand".to_string()],
            ..Default::default()
        };
        assert!(behavior.is_muted("somebrand"));
        assert!(!behavior.is_muted("other"));
    }

    #[test]
    fn parses_camel_case_file() {
        let raw = r#"[{
            "agentName": "Ava",
            "username": "ava_bot",
            "bio": ["curious"],
            "postingBehavior": { "topicInterval": 600000, "dontTweetAt": ["x"] },
            "model": "gpt-4o"
        }]"#;
        let characters = parse_characters(raw).unwrap();
        assert_eq!(characters.len(), 1);
        assert_eq!(characters[0].posting_behavior.topic_interval, Some(600_000));
        assert_eq!(characters[0].temperature, 0.8);
        assert!(find_character(&characters, "AVA").is_some());
    }

    #[test]
    fn non_array_file_rejected() {
        let err = parse_characters(r#"{"agentName": "x"}"#).unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn missing_credentials_block_session() {
        let character = Character::new("Ava", "ava");
        let err = character
            .require_credentials(PlatformKind::Discord)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredentials { .. }));
        assert!(character.require_credentials(PlatformKind::Console).is_ok());
    }
}
