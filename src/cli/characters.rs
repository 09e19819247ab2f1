//! `characters` command: show what the characters file defines.

use std::path::Path;

use crate::agent::Mode;
use crate::character::{Character, PlatformKind, load_characters};

/// Print every character with its credentials and schedule windows.
pub fn run_characters_command(path: &Path) -> anyhow::Result<()> {
    let characters = load_characters(path)?;

    println!("Characters ({})", path.display());
    println!("==========\n");
    if characters.is_empty() {
        println!("  (none)");
        return Ok(());
    }
    for character in &characters {
        print!("{}", describe(character));
    }
    Ok(())
}

fn describe(character: &Character) -> String {
    let mut out = format!("  {} (@{})\n", character.agent_name, character.username);

    let platforms: Vec<&str> = [
        PlatformKind::Twitter,
        PlatformKind::Discord,
        PlatformKind::Telegram,
        PlatformKind::Console,
    ]
    .into_iter()
    .filter(|p| character.require_credentials(*p).is_ok())
    .map(|p| p.as_str())
    .collect();
    out.push_str(&format!("    Platforms:  {}\n", platforms.join(", ")));

    if let Some(model) = &character.model {
        out.push_str(&format!("    Model:      {model}\n"));
    }
    if !character.topics.is_empty() {
        out.push_str(&format!("    Topics:     {}\n", character.topics.join(", ")));
    }
    for mode in Mode::ALL {
        let bounds = character.posting_behavior.bounds_for(mode);
        out.push_str(&format!(
            "    {:<14}every {}-{} min\n",
            format!("{mode}:"),
            bounds.lower().as_secs() / 60,
            bounds.upper().as_secs() / 60,
        ));
    }
    out.push('\n');
    out
}
