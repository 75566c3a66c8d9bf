//! Unifying error type.
//!
//! Leaf modules (the shell tool, the durable log, the HTTP provider) define
//! their own narrow error enums. At the module boundary those get folded
//! into [`AgentWorldError`].

use std::fmt;

#[derive(Debug)]
pub enum AgentWorldError {
    Provider(String),
    ToolExecution(String),
    ApprovalDenied { tool_name: String, tool_call_id: String },
    TurnLimit { agent_id: String, limit: u32 },
    Validation(String),
    Storage(String),
    NotFound(String),
    Conflict(String),
    Timeout(String),
}

impl fmt::Display for AgentWorldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentWorldError::Provider(msg) => write!(f, "provider error: {}", msg),
            AgentWorldError::ToolExecution(msg) => write!(f, "tool execution error: {}", msg),
            AgentWorldError::ApprovalDenied {
                tool_name,
                tool_call_id,
            } => write!(
                f,
                "approval denied for tool '{}' (call {})",
                tool_name, tool_call_id
            ),
            AgentWorldError::TurnLimit { agent_id, limit } => write!(
                f,
                "agent '{}' has reached turn limit {}",
                agent_id, limit
            ),
            AgentWorldError::Validation(msg) => write!(f, "validation error: {}", msg),
            AgentWorldError::Storage(msg) => write!(f, "storage error: {}", msg),
            AgentWorldError::NotFound(msg) => write!(f, "not found: {}", msg),
            AgentWorldError::Conflict(msg) => write!(f, "conflict: {}", msg),
            AgentWorldError::Timeout(msg) => write!(f, "timeout: {}", msg),
        }
    }
}

impl std::error::Error for AgentWorldError {}

impl From<agent_world_store::StoreError> for AgentWorldError {
    fn from(e: agent_world_store::StoreError) -> Self {
        AgentWorldError::Storage(e.to_string())
    }
}

impl From<agent_world_mcp::McpError> for AgentWorldError {
    fn from(e: agent_world_mcp::McpError) -> Self {
        AgentWorldError::ToolExecution(e.to_string())
    }
}

impl From<serde_json::Error> for AgentWorldError {
    fn from(e: serde_json::Error) -> Self {
        AgentWorldError::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentWorldError>;
