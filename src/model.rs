//! Core data model.
//!
//! Plain data types shared by every other module. Behavior lives elsewhere:
//! [`crate::world::World`] owns the collections these types are stored in,
//! [`crate::orchestrator`] mutates `Agent::llm_call_count`, and
//! [`crate::store`] is the only writer of [`StoredEvent`] rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Slugifies a display name into an agent id: lowercase, non-alphanumerics
/// collapsed to single hyphens.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep && !out.is_empty() {
            out.push('-');
            last_was_sep = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub auto_reply: bool,
    pub llm_call_count: u32,
    pub llm_call_limit: u32,
    pub created_at: DateTime<Utc>,
    /// In-memory conversation history, owned exclusively by this agent.
    /// Flattened in seq order it must form a valid LLM conversation once
    /// `filter_client_side_messages` runs.
    pub memory: Vec<StoredEvent>,
}

impl Agent {
    pub fn new(name: impl Into<String>, provider: impl Into<String>, model: impl Into<String>) -> Self {
        let name = name.into();
        let id = slugify(&name);
        Self {
            id,
            name,
            agent_type: "assistant".to_string(),
            provider: provider.into(),
            model: model.into(),
            system_prompt: String::new(),
            temperature: 0.7,
            max_tokens: 4096,
            auto_reply: true,
            llm_call_count: 0,
            llm_call_limit: 5,
            created_at: Utc::now(),
            memory: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_auto_reply(mut self, auto_reply: bool) -> Self {
        self.auto_reply = auto_reply;
        self
    }

    pub fn with_llm_call_limit(mut self, limit: u32) -> Self {
        self.llm_call_limit = limit;
        self
    }

    /// Case-insensitive match against both `id` and `name`, used by the
    /// mention parser.
    pub fn matches_mention(&self, token: &str) -> bool {
        token.eq_ignore_ascii_case(&self.id) || token.eq_ignore_ascii_case(&self.name)
    }

    pub fn at_turn_limit(&self) -> bool {
        self.llm_call_count >= self.llm_call_limit
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: u64,
    pub summary: Option<String>,
}

impl Chat {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            created_at: now,
            updated_at: now,
            message_count: 0,
            summary: None,
        }
    }
}

/// The kind of an event row: `message | sse | system | tool`. `sse` rows capture
/// a streamed chunk/end marker for audit; `tool` rows are role=tool message
/// events with a `tool_call_id` and are also representable as `Message` —
/// kept distinct here so the event store can index by kind without peeking
/// into `role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Message,
    Sse,
    System,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HumanToAgent,
    AgentToAgent,
    AgentToHuman,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// JSON-or-string arguments, as sent over the wire.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn is_client_side(&self) -> bool {
        self.function.name.starts_with("client.")
    }
}

/// Required metadata block on every message event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub owner_agent_ids: Vec<String>,
    pub recipient_agent_id: Option<String>,
    pub direction: Direction,
    pub is_memory_only: bool,
    pub is_cross_agent: bool,
    pub thread_root_id: String,
    pub thread_depth: u32,
    pub has_tool_calls: bool,
}

/// The append-only record. Fields that only apply to message-kind rows are
/// `Option`al so a `system`/`sse` row doesn't need to fake them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: String,
    pub world_id: String,
    pub chat_id: Option<String>,
    pub kind: EventKind,
    pub seq: u64,
    pub created_at: DateTime<Utc>,

    // message-only fields
    pub message_id: Option<String>,
    pub sender: Option<String>,
    pub role: Option<Role>,
    pub content: Option<String>,
    pub reply_to_message_id: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
    pub metadata: Option<MessageMetadata>,
}

impl StoredEvent {
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls
            .as_ref()
            .map(|tc| !tc.is_empty())
            .unwrap_or(false)
    }
}

/// A generic option-prompt pending in a world. Kept in
/// `World::pending_hitl`; resolving one persists the choice as an audit
/// event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlRequest {
    pub request_id: String,
    pub prompt: String,
    pub options: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl HitlRequest {
    pub fn refresh_after_dismiss(&self) -> bool {
        self.metadata
            .get("refreshAfterDismiss")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Reconstructed (not stored) view of an approval decision. Produced by
/// scanning chat memory; see `crate::tools::approval`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalScope {
    Once,
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve(ApprovalScope),
    Deny,
}

#[derive(Debug, Clone)]
pub struct ApprovalRecord {
    pub chat_id: Option<String>,
    pub tool_name: String,
    pub args_hash: String,
    pub decision: ApprovalDecision,
    pub timestamp: DateTime<Utc>,
    pub original_tool_call_id: String,
}
