//! Completion-service client abstraction.
//!
//! The fallback orchestrator sends one [`CompletionRequest`] per field group
//! and expects back a JSON object of `{field_name: suggested_value}`.
//!
//! - **[`DisabledClient`]** — refuses every call; used when no provider is
//!   configured.
//! - **[`HttpCompletionClient`]** — OpenAI-compatible chat-completions
//!   endpoint in JSON mode.
//!
//! # Error Classification
//!
//! | Response | [`CompletionError`] | Orchestrator reaction |
//! |----------|---------------------|-----------------------|
//! | HTTP 429 | `RateLimited` | halt further dispatch |
//! | HTTP 408, client timeout | `Timeout` | retry with backoff |
//! | HTTP 5xx | `Server` | retry with backoff |
//! | connection error | `Transport` | retry with backoff |
//! | other 4xx | `Rejected` | fail the group |
//! | non-JSON / non-object body | `Malformed` | fail the group (validation) |
//!
//! Clients make a single attempt per call. Retry and backoff belong to the
//! orchestrator so that every group follows one policy.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use extraction_guard_core::fields::FieldGroup;

use crate::config::{CompletionConfig, FallbackConfig};

/// Minimal, sanitized payload for one group: only that group's fields and a
/// bounded excerpt of the document text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub group: FieldGroup,
    pub fields: BTreeMap<String, Value>,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompletionError {
    #[error("completion service rate limited the request")]
    RateLimited,
    #[error("completion call timed out")]
    Timeout,
    #[error("completion service error {0}")]
    Server(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("completion service rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed completion response: {0}")]
    Malformed(String),
    #[error("completion provider is disabled")]
    Disabled,
}

impl CompletionError {
    /// Worth another attempt with backoff. Rate limiting is handled
    /// separately (it halts dispatch) and is not included here.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CompletionError::Timeout | CompletionError::Server(_) | CompletionError::Transport(_)
        )
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Value, CompletionError>;
}

/// Refuses every call.
pub struct DisabledClient;

#[async_trait]
impl CompletionClient for DisabledClient {
    async fn complete(&self, _request: &CompletionRequest) -> Result<Value, CompletionError> {
        Err(CompletionError::Disabled)
    }
}

const DEFAULT_URL: &str = "https://api.openai.com/v1/chat/completions";

const SYSTEM_PROMPT: &str = "You correct fields extracted from an invoice. \
Reply with a single JSON object mapping each requested field name to its corrected value, \
or null when the excerpt does not support a value. Dates are YYYY-MM-DD, amounts are numbers, \
addresses are objects with street, city, region, postal_code, country. \
Do not add fields that were not requested.";

/// Chat-completions client in JSON mode.
pub struct HttpCompletionClient {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

impl HttpCompletionClient {
    /// Build from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` is not set or the API key environment
    /// variable is missing.
    pub fn new(config: &CompletionConfig, fallback: &FallbackConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("completion.model required for OpenAI provider"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        // The orchestrator wraps each call in its own timeout; this one only
        // guards against a connection that never completes at all.
        let client = reqwest::Client::builder()
            .timeout(fallback.call_timeout() + Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone().unwrap_or_else(|| DEFAULT_URL.to_string()),
            model,
            api_key,
        })
    }

    fn body(&self, request: &CompletionRequest) -> Value {
        let user = serde_json::json!({
            "group": request.group.id(),
            "fields": request.fields,
            "excerpt": request.excerpt,
        });
        serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user.to_string() },
            ],
        })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Value, CompletionError> {
        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout
                } else {
                    CompletionError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(CompletionError::RateLimited);
        }
        if status.as_u16() == 408 {
            return Err(CompletionError::Timeout);
        }
        if status.is_server_error() {
            return Err(CompletionError::Server(status.as_u16()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CompletionError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| CompletionError::Malformed(e.to_string()))?;
        parse_chat_response(&json)
    }
}

/// Pull the suggestion object out of `choices[0].message.content`.
fn parse_chat_response(json: &Value) -> Result<Value, CompletionError> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| CompletionError::Malformed("missing choices[0].message.content".into()))?;

    let suggestions: Value = serde_json::from_str(content)
        .map_err(|e| CompletionError::Malformed(format!("content is not JSON: {}", e)))?;
    if !suggestions.is_object() {
        return Err(CompletionError::Malformed(
            "content is not a JSON object".into(),
        ));
    }
    Ok(suggestions)
}

/// Instantiate the configured client.
pub fn create_client(
    config: &CompletionConfig,
    fallback: &FallbackConfig,
) -> anyhow::Result<Box<dyn CompletionClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledClient)),
        "openai" => Ok(Box::new(HttpCompletionClient::new(config, fallback)?)),
        other => anyhow::bail!("Unknown completion provider: {}", other),
    }
}
