//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running agents on a platform (`run`)
//! - Chatting with a character in the terminal (`chat`)
//! - Listing configured characters (`characters`)

mod characters;

pub use characters::run_characters_command;

use clap::{Parser, Subcommand};

use crate::agent::Mode;
use crate::character::PlatformKind;

#[derive(Parser, Debug)]
#[command(name = "persona-runtime")]
#[command(about = "Run LLM-driven social media personas")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Characters file (overrides CHARACTERS_PATH)
    #[arg(short, long, global = true)]
    pub characters: Option<std::path::PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start scheduled modes for one or more agents (default if no subcommand given)
    Run {
        /// Agent usernames or names; all characters when empty
        #[arg(short, long)]
        agent: Vec<String>,

        /// Platform to bind the agents to
        #[arg(short, long, default_value = "console")]
        platform: PlatformKind,

        /// Modes to start (topic, auto, mentions); all when empty
        #[arg(short, long)]
        mode: Vec<Mode>,
    },

    /// Chat with a character in this terminal
    Chat {
        /// Agent username or name
        agent: String,
    },

    /// List the characters in the characters file
    Characters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_modes() {
        let cli = Cli::parse_from([
            "persona-runtime",
            "run",
            "--agent",
            "ava",
            "--platform",
            "twitter",
            "--mode",
            "topic",
            "--mode",
            "mentions",
        ]);
        match cli.command {
            Some(Command::Run {
                agent,
                platform,
                mode,
            }) => {
                assert_eq!(agent, vec!["ava"]);
                assert_eq!(platform, PlatformKind::Twitter);
                assert_eq!(mode, vec![Mode::TopicPost, Mode::MentionReply]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn characters_flag_is_global() {
        let cli = Cli::parse_from(["persona-runtime", "characters", "--characters", "c.json"]);
        assert!(matches!(cli.command, Some(Command::Characters)));
        assert_eq!(cli.characters.as_deref(), Some(std::path::Path::new("c.json")));
        assert!(Cli::parse_from(["persona-runtime"]).command.is_none());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["persona-runtime", "run", "--mode", "nap"]).is_err());
    }
}
