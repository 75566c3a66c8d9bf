//! Deterministic provider for tests and examples.
//!
//! A provider with no network dependency whose behavior is scripted ahead
//! of time, so orchestrator tests can assert exact turn sequences without
//! mocking an HTTP server.

use crate::error::AgentWorldError;
use crate::model::Role;
use crate::provider::{
    FinishUsage, LlmMessage, LlmParams, LlmProvider, MessageStream, StreamEvent, StreamItem,
    ToolDefinition,
};
use async_trait::async_trait;
use futures_util::stream;
use std::sync::Mutex;

/// One scripted response: either plain text or a set of tool calls.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    Text(String),
    ToolCalls(Vec<crate::model::ToolCall>),
}

/// A provider that replays a fixed script of turns in order, one per call to
/// `send`/`stream`, regardless of what `messages` actually contains. Useful
/// for driving the orchestrator's tool-execution loop deterministically in
/// tests.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<Vec<ScriptedTurn>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, script: Vec<ScriptedTurn>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(script),
        }
    }

    fn next_turn(&self) -> ScriptedTurn {
        let mut script = self.script.lock().expect("scripted provider poisoned");
        if script.is_empty() {
            ScriptedTurn::Text(String::new())
        } else {
            script.remove(0)
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        _model: &str,
        _messages: &[LlmMessage],
        _tools: &[ToolDefinition],
        _params: &LlmParams,
    ) -> Result<(LlmMessage, FinishUsage), AgentWorldError> {
        let turn = self.next_turn();
        let msg = match turn {
            ScriptedTurn::Text(text) => LlmMessage {
                role: Role::Assistant,
                content: text,
                tool_calls: Vec::new(),
                tool_call_id: None,
            },
            ScriptedTurn::ToolCalls(calls) => LlmMessage {
                role: Role::Assistant,
                content: String::new(),
                tool_calls: calls,
                tool_call_id: None,
            },
        };
        Ok((msg, FinishUsage::default()))
    }

    async fn stream(
        &self,
        _model: &str,
        _messages: &[LlmMessage],
        _tools: &[ToolDefinition],
        _params: &LlmParams,
    ) -> Result<MessageStream, AgentWorldError> {
        let turn = self.next_turn();
        let events: Vec<StreamItem> = match turn {
            ScriptedTurn::Text(text) => {
                let mut events: Vec<StreamItem> = text
                    .split_inclusive(' ')
                    .map(|piece| Ok(StreamEvent::Chunk { delta: piece.to_string() }))
                    .collect();
                events.push(Ok(StreamEvent::End {
                    finish_reason: "stop".to_string(),
                    usage: FinishUsage::default(),
                }));
                events
            }
            ScriptedTurn::ToolCalls(calls) => vec![
                Ok(StreamEvent::ToolCalls { tool_calls: calls }),
                Ok(StreamEvent::End {
                    finish_reason: "tool_calls".to_string(),
                    usage: FinishUsage::default(),
                }),
            ],
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn scripted_provider_replays_text_then_ends() {
        let provider = ScriptedProvider::new(
            "mock",
            vec![ScriptedTurn::Text("hi there".to_string())],
        );
        let mut stream = provider
            .stream("mock-model", &[], &[], &LlmParams::default())
            .await
            .unwrap();
        let mut saw_end = false;
        while let Some(item) = stream.next().await {
            if let Ok(StreamEvent::End { .. }) = item {
                saw_end = true;
            }
        }
        assert!(saw_end);
    }
}
