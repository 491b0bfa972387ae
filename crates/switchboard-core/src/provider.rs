//! Reasoning-model provider interface and HTTP client
//!
//! The provider is an external collaborator: given an instruction, a
//! bounded message history, and the capability signatures visible to the
//! handler, it returns either a routing decision (one line of text) or the
//! handler's next action (a text reply or a capability-invocation request).

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::EngineError;
use crate::types::{ChatMessage, ChatRole};

/// Capability signature exposed to the model; never carries credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Message sent to the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: String,
    pub content: ProviderContent,
}

impl ProviderMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: ProviderContent::Text(content.into()),
        }
    }

    /// Convert a transcript turn; system turns become user-visible context
    /// only through the system parameter, so they are skipped here.
    pub fn from_chat(message: &ChatMessage) -> Option<Self> {
        match message.role {
            ChatRole::System => None,
            ChatRole::User => Some(Self::text("user", message.content.clone())),
            ChatRole::Assistant => Some(Self::text("assistant", message.content.clone())),
        }
    }
}

/// Message content: plain text or structured blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Content block in a provider message or reply
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

/// Reply from the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReply {
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
}

impl ProviderReply {
    /// Concatenated text of all text blocks
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// First capability-invocation request, if the model made one
    pub fn tool_use(&self) -> Option<(&str, &str, &Value)> {
        self.content.iter().find_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }
}

/// Interface to the reasoning model
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        system: &str,
        messages: &[ProviderMessage],
        tools: &[ToolSpec],
    ) -> Result<ProviderReply, EngineError>;
}

/// HTTP client against an Anthropic-style messages endpoint
#[derive(Clone)]
pub struct HttpProvider {
    client: Client,
    api_key: String,
    base_url: String,
    max_tokens: u32,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Mask the API key in debug output
        let masked_key = if self.api_key.len() > 7 {
            format!(
                "{}...{}",
                &self.api_key[..3],
                &self.api_key[self.api_key.len() - 4..]
            )
        } else {
            "***".to_string()
        };

        f.debug_struct("HttpProvider")
            .field("client", &"<reqwest::Client>")
            .field("api_key", &masked_key)
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl HttpProvider {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key,
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 4096,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    async fn request(
        &self,
        model: &str,
        system: &str,
        messages: &[ProviderMessage],
        tools: &[ToolSpec],
    ) -> anyhow::Result<ProviderReply> {
        let url = format!("{}/v1/messages", self.base_url);

        let body = serde_json::json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": messages,
            "tools": tools,
        });

        debug!(model, message_count = messages.len(), "sending provider request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Failed to send provider request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("provider request failed with status {status}: {error_text}"));
        }

        let reply: ProviderReply = response
            .json()
            .await
            .context("Failed to parse provider response")?;

        debug!(
            blocks = reply.content.len(),
            stop_reason = ?reply.stop_reason,
            "received provider reply"
        );

        Ok(reply)
    }
}

#[async_trait]
impl ModelProvider for HttpProvider {
    async fn chat(
        &self,
        model: &str,
        system: &str,
        messages: &[ProviderMessage],
        tools: &[ToolSpec],
    ) -> Result<ProviderReply, EngineError> {
        self.request(model, system, messages, tools)
            .await
            .map_err(|e| EngineError::Execution(e.to_string()))
    }
}
