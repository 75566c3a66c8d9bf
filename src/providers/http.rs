//! Generic OpenAI-chat-completions-shaped HTTP provider.
//!
//! Most self-hosted and hosted LLM gateways (vLLM, Ollama, LM Studio, plus
//! OpenAI itself) speak this wire format, so one implementation covers the
//! common case without pulling in a vendor-specific client crate. Keeps a
//! single tuned `reqwest::Client` reused for the life of the process rather
//! than building one per call.

use crate::error::AgentWorldError;
use crate::model::{Role, ToolCall, ToolCallFunction};
use crate::provider::{
    FinishUsage, LlmMessage, LlmParams, LlmProvider, MessageStream, StreamEvent, StreamItem,
    ToolDefinition,
};
use async_trait::async_trait;
use futures_util::stream;
use lazy_static::lazy_static;
use serde_json::json;

lazy_static! {
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::Client::builder()
        .build()
        .expect("failed to build shared reqwest client");
}

pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

pub struct HttpChatProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
}

impl HttpChatProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key,
        }
    }

    fn role_str(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    fn build_payload(
        &self,
        model: &str,
        messages: &[LlmMessage],
        tools: &[ToolDefinition],
        params: &LlmParams,
        stream: bool,
    ) -> serde_json::Value {
        let messages_json: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                let mut obj = json!({
                    "role": Self::role_str(m.role),
                    "content": m.content,
                });
                if let Some(id) = &m.tool_call_id {
                    obj["tool_call_id"] = json!(id);
                }
                obj
            })
            .collect();
        let tools_json: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    }
                })
            })
            .collect();
        let mut payload = json!({
            "model": model,
            "messages": messages_json,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": stream,
        });
        if !tools_json.is_empty() {
            payload["tools"] = json!(tools_json);
        }
        payload
    }

    async fn post(&self, payload: serde_json::Value) -> Result<serde_json::Value, AgentWorldError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = shared_http_client().post(&url).json(&payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AgentWorldError::Provider(e.to_string()))?;
        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| AgentWorldError::Provider(e.to_string()))
    }
}

#[async_trait]
impl LlmProvider for HttpChatProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        model: &str,
        messages: &[LlmMessage],
        tools: &[ToolDefinition],
        params: &LlmParams,
    ) -> Result<(LlmMessage, FinishUsage), AgentWorldError> {
        let payload = self.build_payload(model, messages, tools, params, false);
        let body = self.post(payload).await?;
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| AgentWorldError::Provider("response had no choices".to_string()))?;
        let message = choice
            .get("message")
            .ok_or_else(|| AgentWorldError::Provider("choice had no message".to_string()))?;
        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        let tool_calls = message
            .get("tool_calls")
            .and_then(|tc| tc.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|entry| parse_tool_call(entry))
                    .collect()
            })
            .unwrap_or_default();
        let usage = body
            .get("usage")
            .map(|u| FinishUsage {
                prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                completion_tokens: u
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
            })
            .unwrap_or_default();
        Ok((
            LlmMessage {
                role: Role::Assistant,
                content,
                tool_calls,
                tool_call_id: None,
            },
            usage,
        ))
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[LlmMessage],
        tools: &[ToolDefinition],
        params: &LlmParams,
    ) -> Result<MessageStream, AgentWorldError> {
        // Many OpenAI-compatible gateways support server-sent-event streaming
        // over the same endpoint; parsing that wire format is a transport
        // detail this crate does not own ( scopes out wire
        // framing). We fall back to one non-streaming call surfaced as a
        // single chunk followed by `end`, which satisfies the orchestrator's
        // contract even when the upstream gateway
        // cannot stream.
        let (message, usage) = self.send(model, messages, tools, params).await?;
        let events: Vec<StreamItem> = if message.tool_calls.is_empty() {
            vec![
                Ok(StreamEvent::Chunk {
                    delta: message.content,
                }),
                Ok(StreamEvent::End {
                    finish_reason: "stop".to_string(),
                    usage,
                }),
            ]
        } else {
            vec![
                Ok(StreamEvent::ToolCalls {
                    tool_calls: message.tool_calls,
                }),
                Ok(StreamEvent::End {
                    finish_reason: "tool_calls".to_string(),
                    usage,
                }),
            ]
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

fn parse_tool_call(entry: &serde_json::Value) -> Option<ToolCall> {
    let id = entry.get("id")?.as_str()?.to_string();
    let function = entry.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    let arguments_raw = function.get("arguments")?.as_str().unwrap_or("{}");
    let arguments: serde_json::Value =
        serde_json::from_str(arguments_raw).unwrap_or(serde_json::Value::Null);
    Some(ToolCall {
        id,
        call_type: "function".to_string(),
        function: ToolCallFunction { name, arguments },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_payload_includes_tools_only_when_present() {
        let provider = HttpChatProvider::new("test", "http://localhost", None);
        let messages = [LlmMessage::user("hi")];
        let payload = provider.build_payload("gpt", &messages, &[], &LlmParams::default(), false);
        assert!(payload.get("tools").is_none());

        let tools = [ToolDefinition {
            name: "shell_cmd".into(),
            description: "run a command".into(),
            parameters_schema: serde_json::json!({"type": "object"}),
        }];
        let payload = provider.build_payload("gpt", &messages, &tools, &LlmParams::default(), true);
        assert_eq!(payload["tools"][0]["function"]["name"], "shell_cmd");
        assert_eq!(payload["stream"], true);
    }
}
