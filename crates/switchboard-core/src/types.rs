//! Shared types for switchboard-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One turn in a conversation transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

/// Terminal status of one handled request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    ClarificationNeeded,
    Error,
}

/// Normalized, UI-renderable result returned for every request.
///
/// Every pipeline outcome — success, clarification, validation failure,
/// downstream failure, timeout — is expressed as one of these. Callers
/// never see a raw error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub status: ResponseStatus,
    /// Handler that produced the payload, if routing selected one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    /// Detected intent label (e.g. "query", "multi_intent_detected")
    pub intent: String,
    /// Payload in the declared output format
    pub data: Value,
    /// Declared output format name (e.g. "structured_json")
    pub format: String,
    /// Free-form rendering metadata for the UI (e.g. {"type": "table"})
    pub render_hint: Value,
    /// Wall-clock time spent handling the request
    pub elapsed_ms: u64,
}
