//! Retry helpers shared by the HTTP clients.
//!
//! Exponential backoff with jitter plus the status codes worth retrying.
//! Used by the chat completions client and the embeddings provider.

use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

/// Returns `true` if the HTTP status code is transient and worth retrying.
pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Calculate exponential backoff delay with random jitter.
///
/// Base delay is 1 second, doubled each attempt, with +/-25% jitter.
/// - attempt 0: ~1s (0.75s - 1.25s)
/// - attempt 1: ~2s (1.5s - 2.5s)
/// - attempt 2: ~4s (3.0s - 5.0s)
pub(crate) fn retry_backoff_delay(attempt: u32) -> Duration {
    let base_ms: u64 = 1000u64.saturating_mul(2u64.saturating_pow(attempt));
    let jitter_range = base_ms / 4;
    let jitter = if jitter_range > 0 {
        let offset = rand::thread_rng().gen_range(0..=jitter_range * 2);
        offset as i64 - jitter_range as i64
    } else {
        0
    };
    let delay_ms = (base_ms as i64 + jitter).max(100) as u64;
    Duration::from_millis(delay_ms)
}

/// Why a JSON POST gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HttpFailure {
    Transport(String),
    Unauthorized,
    RateLimited,
    Status { status: u16, body: String },
}

/// POST `body` as JSON with bearer auth, retrying transient failures.
///
/// Retries transport errors and retryable statuses up to `max_retries`
/// times with [`retry_backoff_delay`]. 401 is never retried. Returns the
/// raw response body of the first successful response.
pub(crate) async fn post_json_with_retry<T: Serialize + ?Sized>(
    client: &Client,
    url: &str,
    api_key: &SecretString,
    body: &T,
    max_retries: u32,
    label: &str,
) -> Result<String, HttpFailure> {
    let mut attempt = 0;
    loop {
        tracing::debug!(provider = label, url, attempt = attempt + 1, "Sending request");

        let response = client
            .post(url)
            .bearer_auth(api_key.expose_secret())
            .json(body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                if attempt < max_retries {
                    let delay = retry_backoff_delay(attempt);
                    tracing::warn!(
                        provider = label,
                        "Request error (attempt {}/{}), retrying in {:?}: {}",
                        attempt + 1,
                        max_retries + 1,
                        delay,
                        e,
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(HttpFailure::Transport(e.to_string()));
            }
        };

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        if (200..300).contains(&status) {
            return Ok(text);
        }
        if status == 401 {
            return Err(HttpFailure::Unauthorized);
        }
        if is_retryable_status(status) && attempt < max_retries {
            let delay = retry_backoff_delay(attempt);
            tracing::warn!(
                provider = label,
                "HTTP {} (attempt {}/{}), retrying in {:?}",
                status,
                attempt + 1,
                max_retries + 1,
                delay,
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            continue;
        }
        if status == 429 {
            return Err(HttpFailure::RateLimited);
        }
        return Err(HttpFailure::Status { status, body: text });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_status() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(502));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(504));

        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(403));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(422));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn test_retry_backoff_delay_exponential_growth() {
        for _ in 0..20 {
            let d0 = retry_backoff_delay(0);
            let d1 = retry_backoff_delay(1);
            let d2 = retry_backoff_delay(2);

            // Attempt 0: base 1000ms, jitter +/-250ms -> [750, 1250]
            assert!(d0.as_millis() >= 750, "attempt 0 too low: {:?}", d0);
            assert!(d0.as_millis() <= 1250, "attempt 0 too high: {:?}", d0);

            // Attempt 1: base 2000ms, jitter +/-500ms -> [1500, 2500]
            assert!(d1.as_millis() >= 1500, "attempt 1 too low: {:?}", d1);
            assert!(d1.as_millis() <= 2500, "attempt 1 too high: {:?}", d1);

            // Attempt 2: base 4000ms, jitter +/-1000ms -> [3000, 5000]
            assert!(d2.as_millis() >= 3000, "attempt 2 too low: {:?}", d2);
            assert!(d2.as_millis() <= 5000, "attempt 2 too high: {:?}", d2);
        }
    }

    #[test]
    fn test_retry_backoff_delay_no_overflow() {
        // Very high attempt numbers should not panic from overflow
        let delay = retry_backoff_delay(30);
        assert!(delay.as_millis() >= 100);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_failure() {
        let client = Client::new();
        let key = SecretString::from("sk-test".to_string());
        let result = post_json_with_retry(
            &client,
            "http://127.0.0.1:1/v1/chat/completions",
            &key,
            &serde_json::json!({}),
            0,
            "test",
        )
        .await;
        assert!(matches!(result, Err(HttpFailure::Transport(_))));
    }
}
