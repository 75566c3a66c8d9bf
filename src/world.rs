//! World runtime.
//!
//! A `World` owns its agents, chats, event bus, activity counter, and the
//! pending-HITL table. Nothing outside `World` mutates those collections
//! directly; callers go through `publish_message` or the accessor methods
//! here.

use crate::event_bus::{BusPayload, Channel, EventBus, SystemMessage};
use crate::memory::{append_to_owners, direction_for, resolve_thread};
use crate::model::{Agent, Chat, EventKind, HitlRequest, MessageMetadata, Role, StoredEvent};
use crate::streaming::ActivityCounter;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorldConfig {
    pub id: String,
    pub name: String,
    pub description: String,
    pub turn_limit: u32,
    pub default_provider: String,
    pub default_model: String,
    pub working_directory: String,
}

impl WorldConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            turn_limit: 5,
            default_provider: String::new(),
            default_model: String::new(),
            working_directory: "./".to_string(),
        }
    }
}

/// Parameters accepted by `publish_message`; mirrors the optional fields of
/// `publishMessage` convenience.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub message_id: Option<String>,
    pub reply_to_message_id: Option<String>,
    pub chat_id: Option<String>,
    pub recipient_agent_id: Option<String>,
    /// Agents whose memory this event is appended to. The orchestrator
    /// computes this from `shouldAgentRespond` before calling
    /// `publish_message`; callers that don't care about per-agent routing
    /// (tests, simple broadcasts) can leave this `None` to fall back to
    /// "every other agent in the world".
    pub owner_agent_ids: Option<Vec<String>>,
    /// True when none of the owning agents will actually reply to this
    /// message (mention-missed or cross-agent broadcast absorbed into
    /// memory only).
    pub is_memory_only: bool,
}

pub struct World {
    pub config: Mutex<WorldConfig>,
    pub agents: Mutex<HashMap<String, Agent>>,
    pub chats: Mutex<HashMap<String, Chat>>,
    pub current_chat_id: Mutex<Option<String>>,
    pub pending_hitl: Mutex<HashMap<String, HitlRequest>>,
    pub bus: EventBus,
    pub activity: Arc<ActivityCounter>,
    /// Shared wake signal for every connection's `IdleWaiter`: the
    /// orchestrator notifies it on each qualifying SSE emission so all
    /// waiters for this world extend together.
    pub activity_notify: Arc<Notify>,
    by_message_id: Mutex<HashMap<String, StoredEvent>>,
}

impl World {
    pub fn new(config: WorldConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            agents: Mutex::new(HashMap::new()),
            chats: Mutex::new(HashMap::new()),
            current_chat_id: Mutex::new(None),
            pending_hitl: Mutex::new(HashMap::new()),
            bus: EventBus::new(),
            activity: Arc::new(ActivityCounter::new()),
            activity_notify: Arc::new(Notify::new()),
            by_message_id: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> String {
        self.config.lock().expect("world config poisoned").id.clone()
    }

    pub fn add_agent(&self, agent: Agent) {
        self.agents.lock().expect("world agents poisoned").insert(agent.id.clone(), agent);
    }

    pub fn remove_agent(&self, agent_id: &str) -> Option<Agent> {
        self.agents.lock().expect("world agents poisoned").remove(agent_id)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.lock().expect("world agents poisoned").keys().cloned().collect()
    }

    /// Convenience wrapping stamping, dedup, persistence, and fan-out.
    /// Determines `ownerAgentIds` by asking every agent whether it would
    /// respond, appends per-owner memory rows, then emits on `message`.
    ///
    /// Returns the canonical stored event (the one row written to the event
    /// store; per-agent memory copies are a derived view, not separate rows).
    pub fn publish_message(
        &self,
        content: impl Into<String>,
        sender: impl Into<String>,
        sender_is_agent: bool,
        options: PublishOptions,
    ) -> StoredEvent {
        let content = content.into();
        let sender = sender.into();
        let message_id = options.message_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let chat_id = options.chat_id.or_else(|| self.current_chat_id.lock().expect("current chat poisoned").clone());

        if let Some(existing) = self.by_message_id.lock().expect("dedup map poisoned").get(&message_id) {
            return existing.clone();
        }

        let (thread_root_id, thread_depth) = {
            let by_id = self.by_message_id.lock().expect("dedup map poisoned");
            let lookup: HashMap<String, StoredEvent> = by_id.clone();
            resolve_thread(&message_id, options.reply_to_message_id.as_deref(), &lookup)
        };

        let recipient_is_agent: Option<bool> = options
            .recipient_agent_id
            .as_ref()
            .map(|r| self.agents.lock().expect("world agents poisoned").contains_key(r));
        let direction = direction_for(sender_is_agent, recipient_is_agent);

        let owner_agent_ids: Vec<String> = match &options.owner_agent_ids {
            Some(explicit) => explicit.clone(),
            None => {
                let mut owners: Vec<String> = Vec::new();
                if let Some(recipient) = &options.recipient_agent_id {
                    owners.push(recipient.clone());
                }
                let agents = self.agents.lock().expect("world agents poisoned");
                for agent in agents.values() {
                    if agent.id != sender && !owners.contains(&agent.id) {
                        owners.push(agent.id.clone());
                    }
                }
                owners
            }
        };

        let role = if sender_is_agent { Role::Assistant } else { Role::User };
        let metadata = MessageMetadata {
            owner_agent_ids: owner_agent_ids.clone(),
            recipient_agent_id: options.recipient_agent_id.clone(),
            direction,
            is_memory_only: options.is_memory_only,
            is_cross_agent: sender_is_agent && recipient_is_agent.unwrap_or(false),
            thread_root_id,
            thread_depth,
            has_tool_calls: false,
        };

        let event = StoredEvent {
            id: Uuid::new_v4().to_string(),
            world_id: self.id(),
            chat_id,
            kind: EventKind::Message,
            seq: 0,
            created_at: Utc::now(),
            message_id: Some(message_id.clone()),
            sender: Some(sender),
            role: Some(role),
            content: Some(content),
            reply_to_message_id: options.reply_to_message_id,
            tool_calls: None,
            tool_call_id: None,
            metadata: Some(metadata),
        };

        self.by_message_id
            .lock()
            .expect("dedup map poisoned")
            .insert(message_id, event.clone());

        {
            let mut agents = self.agents.lock().expect("world agents poisoned");
            let mut memories: HashMap<String, Vec<StoredEvent>> = HashMap::new();
            append_to_owners(&event, &owner_agent_ids, &mut memories);
            for (owner, rows) in memories {
                if let Some(agent) = agents.get_mut(&owner) {
                    agent.memory.extend(rows);
                }
            }
        }

        self.bus.publish(Channel::Message, BusPayload::Message(event.clone()));
        event
    }

    pub fn publish_system(&self, message: SystemMessage) {
        self.bus.publish(Channel::System, BusPayload::System(message));
    }

    pub fn enqueue_hitl(&self, request: HitlRequest) {
        self.pending_hitl
            .lock()
            .expect("pending hitl poisoned")
            .insert(request.request_id.clone(), request);
    }

    pub fn resolve_hitl(&self, request_id: &str) -> Option<HitlRequest> {
        self.pending_hitl.lock().expect("pending hitl poisoned").remove(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_message_is_idempotent_by_message_id() {
        let world = World::new(WorldConfig::new("w1", "Test World"));
        world.add_agent(Agent::new("Helper", "mock", "mock"));
        let opts = PublishOptions {
            message_id: Some("fixed-id".to_string()),
            ..Default::default()
        };
        let e1 = world.publish_message("hello", "human", false, opts.clone());
        let e2 = world.publish_message("hello", "human", false, opts);
        assert_eq!(e1.id, e2.id);
        let agents = world.agents.lock().unwrap();
        assert_eq!(agents.get("helper").unwrap().memory.len(), 1);
    }

    #[test]
    fn publish_message_appends_to_every_other_agent() {
        let world = World::new(WorldConfig::new("w1", "Test World"));
        world.add_agent(Agent::new("Helper", "mock", "mock"));
        world.add_agent(Agent::new("Reviewer", "mock", "mock"));
        world.publish_message("hello", "human", false, PublishOptions::default());
        let agents = world.agents.lock().unwrap();
        assert_eq!(agents.get("helper").unwrap().memory.len(), 1);
        assert_eq!(agents.get("reviewer").unwrap().memory.len(), 1);
    }
}
