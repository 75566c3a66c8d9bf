//! LLM provider abstraction and streaming contract.
//!
//! The trait deliberately excludes conversation bookkeeping (that is
//! `crate::orchestrator`'s job) and excludes any concrete vendor wiring.
//! `crate::providers` supplies one concrete, generic implementation (HTTP,
//! OpenAI-chat-completions shaped) plus a deterministic mock used throughout
//! the test suite.

use crate::model::{Role, ToolCall};
use async_trait::async_trait;
use futures_util::stream::Stream;
use std::pin::Pin;

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// One entry of the message list sent to the provider. Tool results are
/// represented as `{role: "tool", tool_call_id, content}`.
#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
}

impl LlmMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FinishUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Yielded by a provider's streaming call: chunk / tool_calls / end.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk { delta: String },
    ToolCalls { tool_calls: Vec<ToolCall> },
    End {
        finish_reason: String,
        usage: FinishUsage,
    },
}

pub type StreamItem = Result<StreamEvent, crate::error::AgentWorldError>;
pub type MessageStream = Pin<Box<dyn Stream<Item = StreamItem> + Send>>;

/// Trait-driven abstraction for a concrete LLM vendor. All implementations
/// must be `Send + Sync` so they can be shared across concurrently streaming
/// agents within a world.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Non-streaming call, used when the global streaming toggle
    /// (`crate::config::streaming_enabled`) is off.
    async fn send(
        &self,
        model: &str,
        messages: &[LlmMessage],
        tools: &[ToolDefinition],
        params: &LlmParams,
    ) -> Result<(LlmMessage, FinishUsage), crate::error::AgentWorldError>;

    /// Streaming call. Returns a stream yielding zero or more `Chunk`s,
    /// optionally a `ToolCalls` event, and exactly one terminal `End`.
    async fn stream(
        &self,
        model: &str,
        messages: &[LlmMessage],
        tools: &[ToolDefinition],
        params: &LlmParams,
    ) -> Result<MessageStream, crate::error::AgentWorldError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_message_carries_call_id() {
        let msg = LlmMessage::tool_result("call_1", "ok");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }
}
