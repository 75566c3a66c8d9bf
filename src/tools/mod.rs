//! Tool registry and dispatcher: models tool dispatch as a small set of
//! tagged variants, switching on the variant to run the appropriate
//! executor rather than a polymorphic handler trait.
//!
//! Three executors, no polymorphic handler trait:
//! - client-side (`client.*`): never runs in-process, the orchestrator just
//!   stops and waits for a `tool_result`.
//! - built-in (`shell_cmd`, `load_skill`, `create_agent`, `hitl_request`):
//!   runs in this crate.
//! - MCP-proxied: runs through `agent_world_mcp::McpToolProvider`.
//!
//! `create_agent` and `hitl_request` mutate `crate::world::World` state, so
//! their actual execution lives in the orchestrator; this module only
//! classifies calls and carries the self-contained executors (`shell_cmd`,
//! `load_skill`) plus the approval-request synthesis shared by all of them.

pub mod approval;
pub mod shell;
pub mod skill;

use crate::model::{ToolCall, ToolCallFunction};
use crate::provider::ToolDefinition;
use agent_world_mcp::{McpSourceRegistry, McpToolMetadata};
use serde_json::json;
use skill::SkillRegistry;
use std::collections::HashMap;

pub const SHELL_CMD: &str = "shell_cmd";
pub const LOAD_SKILL: &str = "load_skill";
pub const CREATE_AGENT: &str = "create_agent";
pub const HITL_REQUEST: &str = "hitl_request";

/// Tools that always require approval before executing. `load_skill` is
/// validated instead (no approval gate).
pub fn requires_approval(tool_name: &str) -> bool {
    matches!(tool_name, SHELL_CMD | CREATE_AGENT | HITL_REQUEST)
}

/// The tagged variant a tool call resolves to for this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    ClientSide,
    NeedsApproval,
    RunShell,
    RunLoadSkill,
    RunCreateAgent,
    RunHitlRequest,
    RunMcp(String),
    Unknown,
}

/// Classifies one tool call. `approved` must be `true` only once an
/// approval/HITL decision for this specific call has already been resolved
/// — callers re-dispatch after consuming an
/// approval rather than threading approval state through this function.
pub fn dispatch(tool_call: &ToolCall, mcp_index: &HashMap<String, String>, approved: bool) -> Dispatch {
    let name = tool_call.function.name.as_str();
    if name.starts_with("client.") {
        return Dispatch::ClientSide;
    }
    if requires_approval(name) && !approved {
        return Dispatch::NeedsApproval;
    }
    match name {
        SHELL_CMD => Dispatch::RunShell,
        LOAD_SKILL => Dispatch::RunLoadSkill,
        CREATE_AGENT => Dispatch::RunCreateAgent,
        HITL_REQUEST => Dispatch::RunHitlRequest,
        other => match mcp_index.get(other) {
            Some(source_id) => Dispatch::RunMcp(source_id.clone()),
            None => Dispatch::Unknown,
        },
    }
}

/// Synthesizes the `client.requestApproval` call appended to the assistant
/// message when a built-in tool needs approval ( step
/// 2). `synthetic_id` should be fresh per request (the orchestrator assigns
/// it, e.g. a uuid) so `approval::scan_approvals` can key off it.
pub fn build_approval_request(synthetic_id: impl Into<String>, original: &ToolCall) -> ToolCall {
    ToolCall {
        id: synthetic_id.into(),
        call_type: "function".to_string(),
        function: ToolCallFunction {
            name: approval::CLIENT_REQUEST_APPROVAL.to_string(),
            arguments: json!({
                "originalToolCall": {
                    "id": original.id,
                    "name": original.function.name,
                    "args": original.function.arguments,
                },
                "message": format!("Approve tool call '{}'?", original.function.name),
                "options": ["deny", "approve_once", "approve_session"],
            }),
        },
    }
}

/// JSON-schema tool definitions surfaced to the LLM for the built-ins, used
/// alongside any MCP-discovered definitions.
pub fn builtin_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: SHELL_CMD.to_string(),
            description: "Run a shell command inside the world's working directory.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "parameters": {"type": "array", "items": {"type": "string"}},
                    "directory": {"type": "string"},
                    "timeout": {"type": "integer"}
                },
                "required": ["command"]
            }),
        },
        ToolDefinition {
            name: LOAD_SKILL.to_string(),
            description: "Load instructions for a registered skill by id.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {"skill_id": {"type": "string"}},
                "required": ["skill_id"]
            }),
        },
        ToolDefinition {
            name: CREATE_AGENT.to_string(),
            description: "Create a new agent in the current world.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "role": {"type": "string"},
                    "nextAgent": {"type": "string"},
                    "autoReply": {"type": "boolean"}
                },
                "required": ["name"]
            }),
        },
        ToolDefinition {
            name: HITL_REQUEST.to_string(),
            description: "Ask a human to choose among a fixed set of options.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "prompt": {"type": "string"},
                    "options": {"type": "array", "items": {"type": "string"}, "minItems": 1}
                },
                "required": ["prompt", "options"]
            }),
        },
    ]
}

pub fn mcp_tool_definition(meta: &McpToolMetadata) -> ToolDefinition {
    let properties: serde_json::Map<String, serde_json::Value> = meta
        .parameters
        .iter()
        .map(|p| {
            (
                p.name.clone(),
                json!({"type": p.param_type, "description": p.description}),
            )
        })
        .collect();
    let required: Vec<&str> = meta
        .parameters
        .iter()
        .filter(|p| p.required)
        .map(|p| p.name.as_str())
        .collect();
    ToolDefinition {
        name: meta.name.clone(),
        description: meta.description.clone(),
        parameters_schema: json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    }
}

/// `{prompt, options}` deserialization target for the `hitl_request` built-in.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HitlRequestArgs {
    pub prompt: String,
    pub options: Vec<String>,
}

/// Validates `hitl_request` arguments: at least
/// one option, no free-text answers accepted.
pub fn validate_hitl_request(args: &HitlRequestArgs) -> Result<(), String> {
    if args.options.is_empty() {
        return Err("hitl_request requires at least one option".to_string());
    }
    Ok(())
}

/// `{name, role, nextAgent, autoReply}` deserialization target for the
/// `create_agent` built-in.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateAgentArgs {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(rename = "nextAgent", default)]
    pub next_agent: Option<String>,
    #[serde(rename = "autoReply", default)]
    pub auto_reply: Option<bool>,
}

/// Builds the system prompt for an agent created via `create_agent`, matching
/// literal template.
pub fn create_agent_system_prompt(name: &str, role: &str, next_agent: &str) -> String {
    format!(
        "You are agent {name}. Your role is {role}.\n\nAlways respond in exactly this structure:\n@{next_agent}\n{{Your response}}",
        name = name,
        role = role,
        next_agent = next_agent,
    )
}

/// Bundles the skill registry and MCP source registry the orchestrator
/// needs per world: one place to classify a call and fetch the combined
/// tool-definition list handed to the LLM.
#[derive(Default)]
pub struct ToolRegistry {
    pub skills: SkillRegistry,
    pub mcp: McpSourceRegistry,
    mcp_tool_sources: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-discovers which tool names each registered MCP source currently
    /// exposes. Call after registering/unregistering a source.
    pub async fn refresh_mcp_index(&mut self) {
        self.mcp_tool_sources.clear();
        for (source_id, meta) in self.mcp.list_all().await {
            self.mcp_tool_sources.insert(meta.name, source_id);
        }
    }

    pub fn classify(&self, tool_call: &ToolCall, approved: bool) -> Dispatch {
        dispatch(tool_call, &self.mcp_tool_sources, approved)
    }

    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = builtin_tool_definitions();
        for (_source_id, meta) in self.mcp.list_all().await {
            defs.push(mcp_tool_definition(&meta));
        }
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolCallFunction;

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            call_type: "function".into(),
            function: ToolCallFunction {
                name: name.into(),
                arguments: json!({}),
            },
        }
    }

    #[test]
    fn classifies_client_side() {
        let index = HashMap::new();
        assert_eq!(dispatch(&call("client.requestApproval"), &index, false), Dispatch::ClientSide);
    }

    #[test]
    fn create_agent_needs_approval_until_approved() {
        let index = HashMap::new();
        assert_eq!(dispatch(&call(CREATE_AGENT), &index, false), Dispatch::NeedsApproval);
        assert_eq!(dispatch(&call(CREATE_AGENT), &index, true), Dispatch::RunCreateAgent);
    }

    #[test]
    fn shell_cmd_needs_approval_until_approved() {
        let index = HashMap::new();
        assert_eq!(dispatch(&call(SHELL_CMD), &index, false), Dispatch::NeedsApproval);
        assert_eq!(dispatch(&call(SHELL_CMD), &index, true), Dispatch::RunShell);
    }

    #[test]
    fn unregistered_tool_is_unknown_then_resolves_via_mcp_index() {
        let mut index = HashMap::new();
        assert_eq!(dispatch(&call("search_web"), &index, false), Dispatch::Unknown);
        index.insert("search_web".to_string(), "web-source".to_string());
        assert_eq!(
            dispatch(&call("search_web"), &index, false),
            Dispatch::RunMcp("web-source".to_string())
        );
    }

    #[test]
    fn create_agent_prompt_matches_template() {
        let prompt = create_agent_system_prompt("helper", "does helpful things", "researcher");
        assert_eq!(
            prompt,
            "You are agent helper. Your role is does helpful things.\n\nAlways respond in exactly this structure:\n@researcher\n{Your response}"
        );
    }

    #[test]
    fn validate_hitl_rejects_empty_options() {
        let args = HitlRequestArgs {
            prompt: "pick one".into(),
            options: vec![],
        };
        assert!(validate_hitl_request(&args).is_err());
    }
}
