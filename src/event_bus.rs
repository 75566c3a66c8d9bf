//! Per-world typed publish/subscribe bus.
//!
//! Four channels: `message`, `sse`, `system`, and the deprecated `world`
//! channel (kept as a no-op forwarding target — nothing subscribes to it by
//! default, and `publish` on it is a cheap match-and-return). Publishing is
//! fire-and-forget: `publish` invokes every registered handler, *in
//! registration order*, by spawning a detached task per handler. The
//! dispatch loop itself — deciding which handlers to invoke and in what
//! order — runs synchronously inside `publish`; the handler bodies run
//! concurrently with the publisher and with each other.
//!
//! The bus does not track activity; only the orchestrator's begin/complete
//! calls do, so that publishing a message is never
//! mistaken for real work in progress.

use crate::model::{StoredEvent, ToolCall};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Message,
    Sse,
    System,
    /// Deprecated; new code should not subscribe here. Retained only so
    /// legacy publishers calling `publish(Channel::World, ..)` don't error.
    World,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMessage {
    pub level: String,
    pub category: String,
    pub message: String,
}

impl SystemMessage {
    pub fn info(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: "info".to_string(),
            category: category.into(),
            message: message.into(),
        }
    }

    pub fn warn(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: "warn".to_string(),
            category: category.into(),
            message: message.into(),
        }
    }
}

/// Token usage reported on a stream `end` event.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// The SSE wire events of , tagged by `type` and flattened
/// into the envelope's `agentName`/`messageId` common fields at serialization
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SseEventKind {
    Start {
        sender: String,
        #[serde(rename = "worldName")]
        world_name: String,
    },
    Chunk {
        content: String,
        sender: String,
        #[serde(skip_serializing_if = "Option::is_none", rename = "tool_calls")]
        tool_calls: Option<Vec<ToolCall>>,
        #[serde(skip_serializing_if = "Option::is_none", rename = "toolName")]
        tool_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream: Option<String>,
    },
    End {
        content: String,
        sender: String,
        usage: Usage,
    },
    Error {
        error: String,
    },
    #[serde(rename = "tool-start")]
    ToolStart {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        args: serde_json::Value,
        #[serde(rename = "workingDirectory")]
        working_directory: String,
    },
    #[serde(rename = "tool-stream")]
    ToolStream {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        stream: String,
        content: String,
    },
    #[serde(rename = "tool-end")]
    ToolEnd {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        #[serde(rename = "timedOut")]
        timed_out: bool,
    },
    #[serde(rename = "memory-only")]
    MemoryOnly {
        sender: String,
        content: String,
        #[serde(rename = "messageId")]
        message_id: String,
    },
    System {
        level: String,
        category: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseEnvelope {
    #[serde(rename = "agentName")]
    pub agent_name: String,
    #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(flatten)]
    pub event: SseEventKind,
}

impl SseEnvelope {
    pub fn new(agent_name: impl Into<String>, event: SseEventKind) -> Self {
        Self {
            agent_name: agent_name.into(),
            message_id: None,
            event,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn to_wire_line(&self) -> String {
        format!("data: {}", serde_json::to_string(self).unwrap_or_default())
    }
}

#[derive(Clone)]
pub enum BusPayload {
    Message(StoredEvent),
    Sse(SseEnvelope),
    System(SystemMessage),
    World(serde_json::Value),
}

type Handler = Arc<dyn Fn(BusPayload) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Subscription {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<Channel, Vec<Subscription>>>,
    next_id: AtomicU64,
}

/// Handle returned by [`EventBus::subscribe`]; drop it or call
/// [`EventBus::unsubscribe`] to stop receiving events.
pub struct Unsubscribe {
    channel: Channel,
    id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe<F, Fut>(&self, channel: Channel, handler: F) -> Unsubscribe
    where
        F: Fn(BusPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let wrapped: Handler = Arc::new(move |payload| Box::pin(handler(payload)));
        let mut subs = self.subscribers.lock().expect("event bus poisoned");
        subs.entry(channel)
            .or_insert_with(Vec::new)
            .push(Subscription { id, handler: wrapped });
        Unsubscribe { channel, id }
    }

    pub fn unsubscribe(&self, token: Unsubscribe) {
        let mut subs = self.subscribers.lock().expect("event bus poisoned");
        if let Some(list) = subs.get_mut(&token.channel) {
            list.retain(|s| s.id != token.id);
        }
    }

    /// Synchronous dispatch: snapshot the handler list for `channel` (in
    /// registration order) and spawn each one as a detached task. Returns as
    /// soon as every handler has been *scheduled*, not once they've run.
    pub fn publish(&self, channel: Channel, payload: BusPayload) {
        if matches!(channel, Channel::World) {
            log::trace!("publish on deprecated world channel ignored");
            return;
        }
        let handlers: Vec<Handler> = {
            let subs = self.subscribers.lock().expect("event bus poisoned");
            subs.get(&channel)
                .map(|list| list.iter().map(|s| s.handler.clone()).collect())
                .unwrap_or_default()
        };
        log::debug!(
            "publishing on {:?} to {} subscriber(s)",
            channel,
            handlers.len()
        );
        for handler in handlers {
            let payload = payload.clone();
            tokio::spawn(async move {
                handler(payload).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn handlers_fire_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            bus.subscribe(Channel::System, move |_payload| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(n);
                }
            });
        }
        bus.publish(
            Channel::System,
            BusPayload::System(SystemMessage::info("test", "hi")),
        );
        // give the spawned tasks a turn to run
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let token = bus.subscribe(Channel::System, move |_payload| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        bus.unsubscribe(token);
        bus.publish(
            Channel::System,
            BusPayload::System(SystemMessage::info("test", "hi")),
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sse_envelope_serializes_with_wire_field_names() {
        let env = SseEnvelope::new(
            "a1",
            SseEventKind::ToolStart {
                tool_name: "shell_cmd".into(),
                tool_call_id: "call_1".into(),
                args: serde_json::json!({"command": "ls"}),
                working_directory: "/work".into(),
            },
        )
        .with_message_id("m1");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "tool-start");
        assert_eq!(json["toolName"], "shell_cmd");
        assert_eq!(json["agentName"], "a1");
        assert_eq!(json["messageId"], "m1");
    }
}
