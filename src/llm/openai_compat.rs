//! OpenAI-compatible chat completions client.

use std::future::Future;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::prompt::{
    build_system_prompt, format_reply, is_refusal_verdict, refusal_check_prompt, unescape_newlines,
};
use crate::llm::retry::{HttpFailure, post_json_with_retry};
use crate::llm::{ContentGenerator, Generation, GenerationMode, GenerationRequest};

const PROVIDER: &str = "openai_compat";

/// Token cap for public posts; chat answers get more room.
const POST_MAX_TOKENS: u32 = 70;
const CHAT_MAX_TOKENS: u32 = 300;
const REFUSAL_CHECK_MAX_TOKENS: u32 = 5;

/// Generator backed by a `/chat/completions` endpoint.
pub struct OpenAiCompatGenerator {
    client: Client,
    config: LlmConfig,
}

impl OpenAiCompatGenerator {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    fn api_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url)
    }

    async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let body = ChatCompletionRequest {
            model,
            messages: vec![
                ChatCompletionMessage {
                    role: "system",
                    content: system,
                },
                ChatCompletionMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens,
            temperature,
        };

        let raw = post_json_with_retry(
            &self.client,
            &self.api_url(),
            &self.config.api_key,
            &body,
            self.config.max_retries,
            PROVIDER,
        )
        .await
        .map_err(map_failure)?;

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&raw).map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: format!("JSON parse error: {e}"),
            })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: "no content in completion".to_string(),
            })
    }
}

fn map_failure(failure: HttpFailure) -> LlmError {
    match failure {
        HttpFailure::Transport(reason) => LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason,
        },
        HttpFailure::Unauthorized => LlmError::AuthFailed {
            provider: PROVIDER.to_string(),
        },
        HttpFailure::RateLimited => LlmError::RateLimited {
            provider: PROVIDER.to_string(),
            retry_after: None,
        },
        HttpFailure::Status { status, body } => LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: format!("HTTP {status}: {body}"),
        },
    }
}

/// Hard cap on regenerations for one post, refusals and length combined.
const MAX_REGENERATIONS: u32 = 10;

/// Regenerate while `content` is a refusal or longer than `limit` characters.
///
/// Once `threshold` refusals have been seen the fallback model (if any) gets
/// one final try. Over-long output is simply regenerated with `model`.
pub(crate) async fn regenerate_until_acceptable<F, Fut, C, CFut>(
    mut content: String,
    limit: usize,
    threshold: u32,
    model: &str,
    fallback: Option<&str>,
    mut regenerate: F,
    mut is_refusal: C,
) -> Result<String, LlmError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<String, LlmError>>,
    C: FnMut(String) -> CFut,
    CFut: Future<Output = Result<bool, LlmError>>,
{
    let mut refusals = 0u32;
    let mut attempts = 0u32;
    let mut refused = is_refusal(content.clone()).await?;

    while refused || content.chars().count() > limit {
        if refused {
            refusals += 1;
            tracing::info!(refusals, threshold, "Model refused, regenerating");
            if refusals >= threshold
                && let Some(fallback) = fallback
            {
                tracing::info!(model = fallback, "Switching to fallback model");
                content = regenerate(fallback.to_string()).await?;
                if content.chars().count() > limit {
                    return Err(LlmError::InvalidResponse {
                        provider: PROVIDER.to_string(),
                        reason: format!("fallback output longer than {limit} characters"),
                    });
                }
                return Ok(content);
            }
        } else {
            tracing::info!(limit, "Content too long, regenerating");
        }

        attempts += 1;
        if attempts > MAX_REGENERATIONS {
            return Err(LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: format!(
                    "no usable output after {MAX_REGENERATIONS} regenerations ({refusals} refusals)"
                ),
            });
        }
        content = regenerate(model.to_string()).await?;
        refused = is_refusal(content.clone()).await?;
    }
    Ok(content)
}

#[async_trait]
impl ContentGenerator for OpenAiCompatGenerator {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<Generation, LlmError> {
        let character = request.character;
        if request.input.trim().is_empty() {
            return Err(LlmError::EmptyInput {
                character: character.username.clone(),
                reason: "nothing to respond to".to_string(),
            });
        }

        let chat = request.mode == GenerationMode::Chat;
        let mut prompt = build_system_prompt(character, request.mode, &request.input);
        if let Some(history) = &request.history {
            prompt.push_str("\n\n# Recent history\n");
            prompt.push_str(history);
        }
        let model = character.model_for(chat, &self.config.default_model);
        let max_tokens = if chat { CHAT_MAX_TOKENS } else { POST_MAX_TOKENS };

        let mut content = self
            .complete(&model, &prompt, &request.input, max_tokens, character.temperature)
            .await?;

        if request.mode.is_public_post() {
            let check_prompt = refusal_check_prompt(character);
            content = regenerate_until_acceptable(
                content,
                self.config.max_post_length,
                self.config.refusal_threshold,
                &model,
                character.fallback_model.as_deref(),
                |m| {
                    let prompt = &prompt;
                    async move {
                        self.complete(&m, prompt, &request.input, max_tokens, character.temperature)
                            .await
                    }
                },
                |candidate| {
                    let (check_prompt, model) = (&check_prompt, &model);
                    async move {
                        let answer = self
                            .complete(
                                model,
                                check_prompt,
                                &candidate,
                                REFUSAL_CHECK_MAX_TOKENS,
                                character.temperature,
                            )
                            .await?;
                        Ok(is_refusal_verdict(&answer))
                    }
                },
            )
            .await?;
        }

        let content = match request.mode {
            GenerationMode::TopicPost => unescape_newlines(&content),
            GenerationMode::Reply | GenerationMode::Chat => {
                format_reply(&content, &character.posting_behavior)
            }
        };
        tracing::debug!(
            agent = %character.username,
            mode = ?request.mode,
            chars = content.chars().count(),
            "Generated content"
        );
        Ok(Generation { prompt, content })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatCompletionMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatCompletionMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn long() -> String {
        "x".repeat(300)
    }

    /// Replays scripted outputs per model and records which model was asked.
    struct Script {
        calls: Mutex<Vec<String>>,
        main: Mutex<Vec<String>>,
    }

    impl Script {
        fn new(main: &[&str]) -> Self {
            let mut main: Vec<String> = main.iter().map(|s| s.to_string()).collect();
            main.reverse();
            Self {
                calls: Mutex::new(Vec::new()),
                main: Mutex::new(main),
            }
        }

        fn next(&self, model: String) -> String {
            let out = if model == "small" {
                "fallback".to_string()
            } else {
                self.main.lock().unwrap().pop().unwrap_or_else(|| "ok".to_string())
            };
            self.calls.lock().unwrap().push(model);
            out
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    async fn never_refused(_: String) -> Result<bool, LlmError> {
        Ok(false)
    }

    async fn refused_when_sorry(text: String) -> Result<bool, LlmError> {
        Ok(text.starts_with("sorry"))
    }

    #[tokio::test]
    async fn acceptable_content_is_returned_untouched() {
        let script = Script::new(&[]);
        let out = regenerate_until_acceptable(
            "short".to_string(),
            280,
            3,
            "main",
            None,
            |m| {
                let out = script.next(m);
                async move { Ok::<String, LlmError>(out) }
            },
            never_refused,
        )
        .await
        .unwrap();
        assert_eq!(out, "short");
        assert!(script.calls().is_empty());
    }

    #[tokio::test]
    async fn long_content_regenerates_with_main_model_only() {
        let (l1, l2, l3) = (long(), long(), long());
        let script = Script::new(&[&l1, &l2, &l3, "ok"]);
        let out = regenerate_until_acceptable(
            long(),
            280,
            3,
            "main",
            Some("small"),
            |m| {
                let out = script.next(m);
                async move { Ok::<String, LlmError>(out) }
            },
            never_refused,
        )
        .await
        .unwrap();
        assert_eq!(out, "ok");
        assert_eq!(script.calls(), vec!["main"; 4]);
    }

    #[tokio::test]
    async fn refusal_is_regenerated() {
        let script = Script::new(&["fine post"]);
        let out = regenerate_until_acceptable(
            "sorry, I can't".to_string(),
            280,
            3,
            "main",
            Some("small"),
            |m| {
                let out = script.next(m);
                async move { Ok::<String, LlmError>(out) }
            },
            refused_when_sorry,
        )
        .await
        .unwrap();
        assert_eq!(out, "fine post");
        assert_eq!(script.calls(), vec!["main"]);
    }

    #[tokio::test]
    async fn repeated_refusals_switch_to_fallback() {
        let script = Script::new(&["sorry again", "sorry once more"]);
        let out = regenerate_until_acceptable(
            "sorry".to_string(),
            280,
            3,
            "main",
            Some("small"),
            |m| {
                let out = script.next(m);
                async move { Ok::<String, LlmError>(out) }
            },
            refused_when_sorry,
        )
        .await
        .unwrap();
        assert_eq!(out, "fallback");
        assert_eq!(script.calls(), vec!["main", "main", "small"]);
    }

    #[tokio::test]
    async fn gives_up_after_regeneration_cap() {
        let err = regenerate_until_acceptable(
            "sorry".to_string(),
            280,
            3,
            "main",
            None,
            |_| async { Ok::<String, LlmError>("sorry".to_string()) },
            refused_when_sorry,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn refusal_check_errors_propagate() {
        let err = regenerate_until_acceptable(
            "post".to_string(),
            280,
            3,
            "main",
            None,
            |_| async { Ok::<String, LlmError>("x".to_string()) },
            |_| async {
                Err::<bool, LlmError>(LlmError::RateLimited {
                    provider: PROVIDER.to_string(),
                    retry_after: None,
                })
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { .. }));
    }

    #[test]
    fn parses_completion_body() {
        let raw = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"gm"},"finish_reason":"stop"}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("gm"));
    }

    #[test]
    fn status_failures_map_to_llm_errors() {
        assert!(matches!(
            map_failure(HttpFailure::Unauthorized),
            LlmError::AuthFailed { .. }
        ));
        assert!(matches!(
            map_failure(HttpFailure::RateLimited),
            LlmError::RateLimited { .. }
        ));
        let err = map_failure(HttpFailure::Status {
            status: 400,
            body: "bad".to_string(),
        });
        assert!(err.to_string().contains("HTTP 400"));
    }
}
