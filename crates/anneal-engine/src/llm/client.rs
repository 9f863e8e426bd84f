//! OpenRouter chat-completions client.
//!
//! One completion per call, JSON-object response format, automatic
//! retry with backoff on rate limits and server errors. Error text
//! from the API is sanitized before it can reach a chat message or a
//! log line.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use anneal_core::ports::CodeModel;

pub(crate) const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const REQUEST_TIMEOUT_SECS: u64 = 60;
const MAX_COMPLETION_TOKENS: u32 = 8192;

/// Maximum length for error content in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    /// Null when the provider refused or errored.
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// Error payload, which OpenRouter can return even with a 200 status.
#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
    #[serde(default)]
    code: Option<i32>,
}

pub struct HttpModel {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl HttpModel {
    pub fn new(api_key: &str, model: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    async fn send_with_retry(&self, request: &ChatRequest) -> anyhow::Result<String> {
        let mut retry_count = 0;

        loop {
            let response = match self
                .client
                .post(OPENROUTER_URL)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(request)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    if (err.is_timeout() || err.is_connect()) && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        tokio::time::sleep(backoff(retry_count)).await;
                        continue;
                    }
                    return Err(err.into());
                }
            };

            let status = response.status();
            let text = response.text().await?;

            if status.is_success() {
                // Upstream provider errors can arrive with a 200 status.
                if let Ok(envelope) = serde_json::from_str::<ApiErrorEnvelope>(&text) {
                    let retryable = envelope
                        .error
                        .code
                        .map(|c| c >= 500 || c == 429)
                        .unwrap_or(true);
                    if retryable && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        tokio::time::sleep(backoff(retry_count)).await;
                        continue;
                    }
                    return Err(anyhow::anyhow!(
                        "Model API error: {}",
                        truncate_str(&envelope.error.message, MAX_ERROR_CONTENT_LEN)
                    ));
                }
                return Ok(text);
            }

            if (status.as_u16() == 429 || status.is_server_error()) && retry_count < MAX_RETRIES {
                retry_count += 1;
                tokio::time::sleep(backoff(retry_count)).await;
                continue;
            }

            let error_msg = match status.as_u16() {
                401 => "Invalid model API key".to_string(),
                429 => format!("Rate limited by model API after {} retries", retry_count),
                500..=599 => format!("Model API server error ({})", status),
                _ => format!("Model API error {}: {}", status, sanitize_api_response(&text)),
            };
            return Err(anyhow::anyhow!("{}", error_msg));
        }
    }
}

#[async_trait]
impl CodeModel for HttpModel {
    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system",
                    content: system.to_string(),
                },
                Message {
                    role: "user",
                    content: user.to_string(),
                },
            ],
            max_tokens: MAX_COMPLETION_TOKENS,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let text = self.send_with_retry(&request).await?;
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("Unexpected model API response shape: {}", e))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Model API returned no choices"))?;

        if let Some(refusal) = &choice.message.refusal {
            return Err(anyhow::anyhow!(
                "Model refused the request: {}",
                truncate_str(refusal, MAX_ERROR_CONTENT_LEN)
            ));
        }

        match choice.message.content {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(anyhow::anyhow!("Model returned empty content")),
        }
    }
}

fn backoff(retry_count: u32) -> std::time::Duration {
    let factor = 1u64 << (retry_count.saturating_sub(1)).min(8);
    std::time::Duration::from_millis(INITIAL_BACKOFF_MS.saturating_mul(factor))
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max).collect();
    format!("{}...", head)
}

/// Keep API error bodies out of chat messages when they might carry
/// credentials.
fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "api_key",
        "apikey",
        "secret",
        "password",
        "credential",
        "bearer",
        "sk-",
    ];

    let truncated = truncate_str(content, MAX_ERROR_CONTENT_LEN);
    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(response details redacted - may contain sensitive data)".to_string();
        }
    }
    truncated
}
