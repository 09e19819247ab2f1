//! Prompt assembly and output cleanup.

use rand::Rng;
use rand::seq::SliceRandom;

use crate::character::{Character, PostingBehavior};
use crate::llm::GenerationMode;
use crate::platform::Item;

/// Inputs this short get the terse reply instructions.
const SHORT_INPUT_CHARS: usize = 20;

fn section(out: &mut String, title: &str, lines: &[String]) {
    if lines.is_empty() {
        return;
    }
    out.push_str("# ");
    out.push_str(title);
    out.push('\n');
    out.push_str(&lines.join("\n"));
    out.push_str("\n\n");
}

/// System prompt for one generation.
pub fn build_system_prompt(character: &Character, mode: GenerationMode, input: &str) -> String {
    let mut prompt = String::new();
    if mode != GenerationMode::TopicPost {
        section(&mut prompt, "Knowledge", &character.knowledge);
    }
    prompt.push_str(&format!(
        "You are {}, posting as @{}.\n\n",
        character.agent_name, character.username
    ));
    section(&mut prompt, "Bio", &character.bio);
    section(&mut prompt, "Lore", &character.lore);
    section(&mut prompt, "Post directions", &character.post_directions);

    match mode {
        GenerationMode::TopicPost => {
            prompt.push_str("Write a single standalone post. No hashtags, no quotation marks.");
        }
        GenerationMode::Reply if input.chars().count() <= SHORT_INPUT_CHARS => {
            prompt.push_str("Reply to the post below in a few words.");
        }
        GenerationMode::Reply => {
            prompt.push_str("Reply to the post below in one or two sentences.");
        }
        GenerationMode::Chat => {
            section(
                &mut prompt,
                "Chat rules",
                &character.posting_behavior.chat_mode_rules,
            );
            prompt.push_str("Answer the latest chat message in character.");
        }
    }
    prompt
}

/// System prompt asking whether a generated text is a model refusal. The
/// candidate text goes in the user message; the answer is YES or NO.
pub(crate) fn refusal_check_prompt(character: &Character) -> String {
    format!(
        "You review posts written for @{} ({}). Decide whether the text below is a \
         refusal, for example the model declining the request or saying it cannot \
         help or that the request breaks a content policy. Answer with exactly one \
         word: YES if it is a refusal, NO otherwise.",
        character.username, character.agent_name
    )
}

/// Whether a refusal-check completion said YES.
pub(crate) fn is_refusal_verdict(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}

/// Render items as `@handle: text` blocks separated by blank lines.
pub fn format_history(items: &[Item]) -> String {
    items
        .iter()
        .map(|item| format!("@{}: {}", item.author_handle, item.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Apply the character's output rules to a generated reply.
pub fn format_reply(text: &str, behavior: &PostingBehavior) -> String {
    let mut reply = unescape_newlines(text);
    if behavior.remove_periods {
        reply = reply.replace('.', "");
    }
    if behavior.only_keep_first_sentence {
        reply = reply.split('\n').next().unwrap_or_default().to_string();
    }
    reply
}

/// Models sometimes emit a literal backslash-n.
pub(crate) fn unescape_newlines(text: &str) -> String {
    text.replace("\\n", "\n")
}

/// Pick a random topic and adjective and phrase the topic-post instruction.
pub fn topic_instruction<R: Rng + ?Sized>(character: &Character, rng: &mut R) -> String {
    let topic = character
        .topics
        .choose(rng)
        .map(String::as_str)
        .unwrap_or("anything on your mind");
    let adjective = character
        .adjectives
        .choose(rng)
        .map(String::as_str)
        .unwrap_or("interesting");
    format!("Generate a post that is {adjective} about {topic}")
}
