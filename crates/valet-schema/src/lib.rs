pub mod analysis;

pub use analysis::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a message within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// A single conversation message, both on the wire and as loaded from the
/// store. `tool_calls`, `analysis` and `metadata` are JSON blobs at this
/// boundary; the typed views live in [`analysis`] and [`ToolCallRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ChatMessage {
    pub fn user(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: Some(conversation_id.into()),
            role: MessageRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: None,
            analysis: None,
            metadata: None,
        }
    }

    pub fn assistant(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: Some(conversation_id.into()),
            role: MessageRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: None,
            analysis: None,
            metadata: None,
        }
    }
}

/// Inbound chat request. `user_query` and `user_id` are required and
/// non-empty; everything else is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub user_query: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_history: Option<Vec<ChatMessage>>,
}

impl ChatRequest {
    /// Validation errors surface as HTTP 400.
    pub fn validate(&self) -> Result<(), String> {
        if self.user_query.trim().is_empty() {
            return Err("userQuery is required and must be non-empty".into());
        }
        if self.user_id.trim().is_empty() {
            return Err("userId is required and must be non-empty".into());
        }
        Ok(())
    }
}

/// One tool invocation surfaced to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedTool {
    pub name: String,
    pub args: serde_json::Value,
    pub result: serde_json::Value,
    pub step_number: u32,
}

/// Normalized tool-call record persisted on the assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub name: String,
    pub args: serde_json::Value,
    pub result: serde_json::Value,
    pub tool_call_id: String,
}

/// Outbound chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub response: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executed_tools: Vec<ExecutedTool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_connections: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_history: Option<Vec<ChatMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<ComprehensiveAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatResponse {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            executed_tools: Vec::new(),
            required_connections: Vec::new(),
            conversation_history: None,
            analysis: None,
            error: None,
        }
    }
}

/// Status of a per-user app connection in the registry.
///
/// Transitions (idempotent, see the registry):
/// INITIATED -> ACTIVE | FAILED; ACTIVE -> INACTIVE | EXPIRED;
/// INACTIVE/EXPIRED -> INITIATED on re-initiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionStatus {
    Initiated,
    Active,
    Inactive,
    Failed,
    Expired,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "INITIATED" => Some(Self::Initiated),
            "ACTIVE" => Some(Self::Active),
            "INACTIVE" => Some(Self::Inactive),
            "FAILED" => Some(Self::Failed),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    /// An INITIATED connection is treated as usable because the broker may
    /// complete the handshake lazily.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Initiated | Self::Active)
    }

    pub fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (*self, next),
            (Initiated, Active)
                | (Initiated, Failed)
                | (Active, Inactive)
                | (Active, Expired)
                | (Inactive, Initiated)
                | (Expired, Initiated)
        )
    }
}
