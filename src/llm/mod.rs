//! LLM client seam: a `(messages, tools) -> {content, tool_calls, tokens}`
//! request/response endpoint, as specified in spec §6. The core only ever
//! calls through the `LlmClient` trait; `OpenAiCompatibleClient` is the one
//! concrete implementation, targeting deepseek/qwen's OpenAI-compatible
//! chat-completions API per `AiConfig`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AiConfig;
use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// OpenAI function-calling tool schema. Strategist analysis disables tool
/// use entirely (spec §4.2); the Trader likewise operates tool-free in the
/// batch-with-regime mode this engine implements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    pub tokens_used: Option<u32>,
    pub model: String,
}

/// The contract the Strategist and Trader consume. Internals (HTTP,
/// retries, rate limiting) are the client's concern.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSchema]>,
        temperature: f64,
        max_tokens: u32,
    ) -> EngineResult<ChatResponse>;
}

/// HTTP client against an OpenAI-compatible chat-completions endpoint
/// (deepseek, qwen). Bounded retry (<=2) with linear back-off for
/// rate-limits and transient network errors; a 4xx "bad request" response
/// is treated as non-retryable per spec §7.
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    config: AiConfig,
}

impl OpenAiCompatibleClient {
    pub fn new(config: AiConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn chat_once(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSchema]>,
        temperature: f64,
        max_tokens: u32,
    ) -> EngineResult<ChatResponse> {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        if let Some(tools) = tools {
            body["tools"] = serde_json::to_value(tools).unwrap_or_default();
        }

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .timeout(Duration::from_secs(self.config.trader_timeout_secs.max(30)))
            .send()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::QueryFailed(format!("malformed LLM response body: {e}")))?;

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::RateLimited(payload.to_string()));
        }
        if status.is_server_error() {
            return Err(EngineError::Transient(payload.to_string()));
        }
        if status.is_client_error() {
            return Err(EngineError::TokenLimit(format!(
                "LLM request rejected ({status}): {payload}"
            )));
        }

        let choice = payload
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .ok_or_else(|| EngineError::QueryFailed("LLM response had no choices".to_string()))?;
        let message = choice.get("message").cloned().unwrap_or_default();
        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        let tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        Some(ToolCall {
                            id: tc.get("id")?.as_str()?.to_string(),
                            name: tc.get("function")?.get("name")?.as_str()?.to_string(),
                            arguments: tc
                                .get("function")?
                                .get("arguments")?
                                .as_str()
                                .unwrap_or("{}")
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let finish_reason = choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .unwrap_or("stop")
            .to_string();
        let tokens_used = payload
            .get("usage")
            .and_then(|u| u.get("total_tokens"))
            .and_then(|t| t.as_u64())
            .map(|t| t as u32);

        Ok(ChatResponse {
            content,
            tool_calls,
            finish_reason,
            tokens_used,
            model: self.config.model.clone(),
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSchema]>,
        temperature: f64,
        max_tokens: u32,
    ) -> EngineResult<ChatResponse> {
        let mut attempt = 0u32;
        let mut backoff_ms: u64 = 500;
        loop {
            match self.chat_once(messages, tools, temperature, max_tokens).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "LLM request failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms += 500;
                }
                Err(e) => {
                    debug!(error = %e, "LLM request exhausted retries or is non-retryable");
                    return Err(e);
                }
            }
        }
    }
}
