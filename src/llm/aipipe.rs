//! AIPipe (OpenRouter-compatible) client with automatic retry for transient
//! errors.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient, TokenUsage};

/// Per-request timeout. Generation calls can legitimately run for minutes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// AIPipe API client.
///
/// Speaks the OpenAI-compatible `/chat/completions` protocol against a
/// configurable base URL, so it works unchanged against OpenRouter or any
/// other compatible gateway.
pub struct AipipeClient {
    client: Client,
    base_url: String,
    api_key: String,
    retry_config: RetryConfig,
}

impl AipipeClient {
    /// Create a new client with default retry configuration.
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            retry_config: RetryConfig::default(),
        }
    }

    /// Create a new client with custom retry configuration.
    pub fn with_retry_config(api_key: String, base_url: String, retry_config: RetryConfig) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            retry_config,
        }
    }

    /// Parse Retry-After header if present (seconds form only).
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }

    /// Create an LlmError from HTTP response status and body.
    fn create_error(
        status: reqwest::StatusCode,
        body: &str,
        retry_after: Option<Duration>,
    ) -> LlmError {
        let status_code = status.as_u16();
        match classify_http_status(status_code) {
            LlmErrorKind::RateLimited => LlmError::rate_limited(body.to_string(), retry_after),
            LlmErrorKind::ClientError => LlmError::client_error(status_code, body.to_string()),
            _ => LlmError::server_error(status_code, body.to_string()),
        }
    }

    /// Execute a single request without retry.
    async fn execute_request(&self, request: &CompletionRequest) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = match self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(REQUEST_TIMEOUT)
            .json(request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if e.is_timeout() {
                    return Err(LlmError::network_error(format!("Request timeout: {}", e)));
                } else if e.is_connect() {
                    return Err(LlmError::network_error(format!("Connection failed: {}", e)));
                } else {
                    return Err(LlmError::network_error(format!("Request failed: {}", e)));
                }
            }
        };

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Self::create_error(status, &body, retry_after));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!(
                "Failed to parse response: {}, body: {}",
                e,
                truncate_body(&body, 500)
            ))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))?;

        // A "length" finish means the file tree is incomplete; surfacing it
        // here keeps half a project out of the pipeline.
        if choice.finish_reason.as_deref() == Some("length") {
            return Err(LlmError::truncated(
                "completion stopped at max_tokens; output is incomplete".to_string(),
            ));
        }

        let content = choice.message.content.unwrap_or_default();
        if content.trim().is_empty() {
            return Err(LlmError::parse_error(
                "Empty completion content".to_string(),
            ));
        }

        Ok(ChatResponse {
            content,
            finish_reason: choice.finish_reason,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            model: parsed.model.or_else(|| Some(request.model.clone())),
        })
    }

    /// Execute a request with automatic retry for transient errors.
    async fn execute_with_retry(&self, request: &CompletionRequest) -> anyhow::Result<ChatResponse> {
        let start = Instant::now();
        let mut attempt = 0;
        let mut last_error: Option<LlmError> = None;

        loop {
            if start.elapsed() > self.retry_config.max_retry_duration {
                let err = last_error.unwrap_or_else(|| {
                    LlmError::network_error("Max retry duration exceeded".to_string())
                });
                return Err(anyhow::anyhow!("{}", err));
            }

            match self.execute_request(request).await {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!(
                            "LLM request succeeded after {} retries (total time: {:?})",
                            attempt,
                            start.elapsed()
                        );
                    }
                    return Ok(response);
                }
                Err(error) => {
                    let should_retry = self.retry_config.should_retry(&error)
                        && attempt < self.retry_config.max_retries;

                    if !should_retry {
                        tracing::error!(
                            "LLM request failed after {} attempts: {}",
                            attempt + 1,
                            error
                        );
                        return Err(anyhow::anyhow!("{}", error));
                    }

                    let delay = error.suggested_delay(attempt);
                    let remaining = self
                        .retry_config
                        .max_retry_duration
                        .saturating_sub(start.elapsed());
                    let actual_delay = delay.min(remaining);

                    if actual_delay.is_zero() {
                        tracing::warn!(
                            "LLM retry attempt {} failed, no time remaining: {}",
                            attempt + 1,
                            error
                        );
                        return Err(anyhow::anyhow!("{}", error));
                    }

                    tracing::warn!(
                        "LLM attempt {} failed with {}, retrying in {:?}: {}",
                        attempt + 1,
                        error.kind,
                        actual_delay,
                        error.message
                    );

                    tokio::time::sleep(actual_delay).await;
                    attempt += 1;
                    last_error = Some(error);
                }
            }
        }
    }
}

#[async_trait]
impl LlmClient for AipipeClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        let request = CompletionRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        tracing::debug!("Sending request to AIPipe: model={}", model);

        self.execute_with_retry(&request).await
    }
}

/// Cut an error body to at most `max` bytes without splitting a character.
fn truncate_body(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// OpenAI-compatible request format.
#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

/// OpenAI-compatible response format.
#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let body = r#"{
            "model": "openai/gpt-4o-mini",
            "choices": [{
                "message": {"role": "assistant", "content": "{\"index.html\": \"<html></html>\"}"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 120, "completion_tokens": 40, "total_tokens": 160}
        }"#;

        let parsed: CompletionResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices.len(), 1);
        assert_eq!(parsed.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(parsed.choices[0]
            .message
            .content
            .as_deref()
            .unwrap()
            .contains("index.html"));
        assert_eq!(parsed.usage.unwrap().completion_tokens, 40);
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        assert_eq!(truncate_body("short", 500), "short");
        assert_eq!(truncate_body("abcdef", 3), "abc");
        assert_eq!(truncate_body("aé", 2), "a");
    }

    #[test]
    fn test_request_omits_unset_options() {
        let request = CompletionRequest {
            model: "test".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: None,
            max_tokens: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("temperature"));
        assert!(!json.contains("max_tokens"));
    }
}
