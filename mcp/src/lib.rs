//! External tool-provider abstraction.
//!
//! `agent-world`'s tool registry dispatches every tool call to one of three
//! executors: client-side, built-in, or MCP-proxied (see the tagged-variant
//! dispatcher in `agent_world::tools`). This crate supplies the third leg: a
//! minimal provider trait that looks exactly like the read side of the Model
//! Context Protocol — `list`, `describe`, `execute` — without committing the
//! core runtime to any particular wire transport. Transport concerns (stdio,
//! HTTP, websockets) belong to whoever implements [`McpToolProvider`], not to
//! this crate or to `agent-world` itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// JSON-schema-ish description of a single tool parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: Option<String>,
    pub required: bool,
}

/// Identity and calling convention of an externally provided tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolMetadata {
    pub name: String,
    pub description: String,
    pub parameters: Vec<McpToolParameter>,
}

/// Outcome of invoking an external tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolResult {
    pub success: bool,
    pub output: serde_json::Value,
    pub error: Option<String>,
}

impl McpToolResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug)]
pub enum McpError {
    Transport(String),
    UnknownTool(String),
    Protocol(String),
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpError::Transport(msg) => write!(f, "mcp transport error: {}", msg),
            McpError::UnknownTool(name) => write!(f, "mcp provider has no tool named {}", name),
            McpError::Protocol(msg) => write!(f, "mcp protocol error: {}", msg),
        }
    }
}

impl Error for McpError {}

/// A source of externally-hosted tools, identified by `world.mcpConfig`
/// entries (spec.md section 4.3.1). Each configured source is wrapped behind
/// this trait; the tool registry never talks HTTP/stdio directly.
#[async_trait]
pub trait McpToolProvider: Send + Sync {
    /// Stable identifier for this source, used to namespace tool names and to
    /// attribute log lines / errors back to the right `mcpConfig` entry.
    fn source_id(&self) -> &str;

    /// Enumerate every tool this source currently exposes.
    async fn list(&self) -> Result<Vec<McpToolMetadata>, McpError>;

    /// Fetch metadata for a single named tool, if it exists.
    async fn describe(&self, tool_name: &str) -> Result<McpToolMetadata, McpError>;

    /// Invoke `tool_name` with `arguments` and return its result.
    async fn execute(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<McpToolResult, McpError>;
}

/// A provider backed by a single HTTP endpoint speaking a JSON request/response
/// convention: `GET {base_url}/tools` for discovery, `POST {base_url}/tools/{name}`
/// for execution. This is the one concrete transport `agent-world` ships so demos
/// and tests have something to point at; production deployments are expected to
/// bring their own [`McpToolProvider`] implementation for their actual MCP server.
pub struct HttpMcpProvider {
    source_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpMcpProvider {
    pub fn new(source_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl McpToolProvider for HttpMcpProvider {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn list(&self) -> Result<Vec<McpToolMetadata>, McpError> {
        let url = format!("{}/tools", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        resp.json::<Vec<McpToolMetadata>>()
            .await
            .map_err(|e| McpError::Protocol(e.to_string()))
    }

    async fn describe(&self, tool_name: &str) -> Result<McpToolMetadata, McpError> {
        let tools = self.list().await?;
        tools
            .into_iter()
            .find(|t| t.name == tool_name)
            .ok_or_else(|| McpError::UnknownTool(tool_name.to_string()))
    }

    async fn execute(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<McpToolResult, McpError> {
        let url = format!("{}/tools/{}", self.base_url, tool_name);
        let resp = self
            .client
            .post(&url)
            .json(&arguments)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        resp.json::<McpToolResult>()
            .await
            .map_err(|e| McpError::Protocol(e.to_string()))
    }
}

/// Aggregates multiple named sources behind one lookup, mirroring
/// `world.mcpConfig`'s "many external tool sources" shape.
#[derive(Default)]
pub struct McpSourceRegistry {
    sources: HashMap<String, Box<dyn McpToolProvider>>,
}

impl McpSourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Box<dyn McpToolProvider>) {
        self.sources.insert(provider.source_id().to_string(), provider);
    }

    pub fn get(&self, source_id: &str) -> Option<&(dyn McpToolProvider)> {
        self.sources.get(source_id).map(|b| b.as_ref())
    }

    pub async fn list_all(&self) -> Vec<(String, McpToolMetadata)> {
        let mut out = Vec::new();
        for (source_id, provider) in &self.sources {
            if let Ok(tools) = provider.list().await {
                for t in tools {
                    out.push((source_id.clone(), t));
                }
            }
        }
        out
    }
}
