//! Event store.
//!
//! Two interchangeable backends behind one trait: `MemoryEventStore` for
//! tests/ephemeral runs, `FileEventStore` for durable per-world JSONL logs
//! built on `agent_world_store::DurableLog`. The durable log's own
//! monotonic `seq` is authoritative — `StoredEvent::seq` is backfilled from
//! the `Record` wrapper on every read/write rather than trusted as written
//! by the caller, so two concurrent appends can never collide on a seq.

use crate::error::{AgentWorldError, Result};
use crate::model::{EventKind, StoredEvent};
use agent_world_store::DurableLog;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub chat_id: Option<String>,
    pub after_seq: Option<u64>,
    pub kinds: Option<Vec<EventKind>>,
    pub limit: Option<usize>,
    pub owner_agent_id: Option<String>,
    pub recipient_agent_id: Option<String>,
    pub thread_root_id: Option<String>,
    pub has_tool_calls: Option<bool>,
    pub is_memory_only: Option<bool>,
    pub is_cross_agent: Option<bool>,
}

impl EventFilter {
    fn matches(&self, event: &StoredEvent) -> bool {
        if let Some(chat_id) = &self.chat_id {
            if event.chat_id.as_deref() != Some(chat_id.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.after_seq {
            if event.seq <= after {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        let meta = event.metadata.as_ref();
        if let Some(owner) = &self.owner_agent_id {
            if !meta.map(|m| m.owner_agent_ids.iter().any(|o| o == owner)).unwrap_or(false) {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient_agent_id {
            if meta.and_then(|m| m.recipient_agent_id.as_deref()) != Some(recipient.as_str()) {
                return false;
            }
        }
        if let Some(root) = &self.thread_root_id {
            if meta.map(|m| m.thread_root_id.as_str()) != Some(root.as_str()) {
                return false;
            }
        }
        if let Some(want) = self.has_tool_calls {
            if meta.map(|m| m.has_tool_calls).unwrap_or(false) != want {
                return false;
            }
        }
        if let Some(want) = self.is_memory_only {
            if meta.map(|m| m.is_memory_only).unwrap_or(false) != want {
                return false;
            }
        }
        if let Some(want) = self.is_cross_agent {
            if meta.map(|m| m.is_cross_agent).unwrap_or(false) != want {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct RemoveOutcome {
    pub removed: usize,
    pub failed_agents: Vec<String>,
}

/// Append-only per-world log. Implementations must
/// honor the messageId idempotency invariant: saving
/// an event whose `message_id` already exists in the target world returns
/// the existing row rather than writing a duplicate.
pub trait EventStore: Send + Sync {
    fn save_event(&self, event: StoredEvent) -> Result<StoredEvent>;

    fn save_events(&self, events: Vec<StoredEvent>) -> Result<Vec<StoredEvent>> {
        let mut saved = Vec::with_capacity(events.len());
        for event in events {
            saved.push(self.save_event(event)?);
        }
        Ok(saved)
    }

    fn get_events(&self, world_id: &str, filter: &EventFilter) -> Result<Vec<StoredEvent>>;

    fn remove_messages_from(&self, world_id: &str, chat_id: Option<&str>, message_id: &str) -> Result<RemoveOutcome>;

    fn branch_chat_from_message(
        &self,
        world_id: &str,
        source_chat_id: &str,
        message_id: &str,
        new_chat_id: &str,
    ) -> Result<Vec<StoredEvent>>;

    fn next_seq(&self, world_id: &str) -> u64;
}

/// In-process, non-durable backend. Used by tests and by CLI one-shot runs
/// that don't need a persisted history.
#[derive(Default)]
pub struct MemoryEventStore {
    worlds: Mutex<HashMap<String, Vec<StoredEvent>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for MemoryEventStore {
    fn save_event(&self, mut event: StoredEvent) -> Result<StoredEvent> {
        let mut worlds = self.worlds.lock().expect("event store poisoned");
        let log = worlds.entry(event.world_id.clone()).or_default();
        if let Some(message_id) = &event.message_id {
            if let Some(existing) = log.iter().find(|e| e.message_id.as_deref() == Some(message_id.as_str())) {
                return Ok(existing.clone());
            }
        }
        event.seq = log.len() as u64;
        log.push(event.clone());
        Ok(event)
    }

    fn get_events(&self, world_id: &str, filter: &EventFilter) -> Result<Vec<StoredEvent>> {
        let worlds = self.worlds.lock().expect("event store poisoned");
        let Some(log) = worlds.get(world_id) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<StoredEvent> = log.iter().filter(|e| filter.matches(e)).cloned().collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn remove_messages_from(&self, world_id: &str, chat_id: Option<&str>, message_id: &str) -> Result<RemoveOutcome> {
        let mut worlds = self.worlds.lock().expect("event store poisoned");
        let Some(log) = worlds.get_mut(world_id) else {
            return Ok(RemoveOutcome::default());
        };
        let cut_seq = log
            .iter()
            .find(|e| e.message_id.as_deref() == Some(message_id) && e.chat_id.as_deref() == chat_id)
            .map(|e| e.seq);
        let Some(cut_seq) = cut_seq else {
            return Err(AgentWorldError::NotFound(format!("message {} not found", message_id)));
        };
        let before = log.len();
        log.retain(|e| !(e.chat_id.as_deref() == chat_id && e.seq >= cut_seq));
        Ok(RemoveOutcome {
            removed: before - log.len(),
            failed_agents: Vec::new(),
        })
    }

    fn branch_chat_from_message(
        &self,
        world_id: &str,
        source_chat_id: &str,
        message_id: &str,
        new_chat_id: &str,
    ) -> Result<Vec<StoredEvent>> {
        let mut worlds = self.worlds.lock().expect("event store poisoned");
        let log = worlds.entry(world_id.to_string()).or_default();
        let cut_seq = log
            .iter()
            .find(|e| e.chat_id.as_deref() == Some(source_chat_id) && e.message_id.as_deref() == Some(message_id))
            .map(|e| e.seq);
        let Some(cut_seq) = cut_seq else {
            return Err(AgentWorldError::NotFound(format!("message {} not found", message_id)));
        };
        let mut next_seq = log.len() as u64;
        let mut copied = Vec::new();
        for event in log.clone() {
            if event.chat_id.as_deref() != Some(source_chat_id) || event.seq > cut_seq {
                continue;
            }
            let mut branched = event.clone();
            branched.chat_id = Some(new_chat_id.to_string());
            branched.seq = next_seq;
            next_seq += 1;
            copied.push(branched);
        }
        log.extend(copied.clone());
        Ok(copied)
    }

    fn next_seq(&self, world_id: &str) -> u64 {
        let worlds = self.worlds.lock().expect("event store poisoned");
        worlds.get(world_id).map(|l| l.len() as u64).unwrap_or(0)
    }
}

/// Durable backend: one `DurableLog<StoredEvent>` per world, opened lazily
/// under `root/<world_id>.jsonl`.
pub struct FileEventStore {
    root: PathBuf,
    logs: Mutex<HashMap<String, DurableLog<StoredEvent>>>,
}

impl FileEventStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            logs: Mutex::new(HashMap::new()),
        }
    }

    fn log_for(&self, world_id: &str) -> Result<DurableLog<StoredEvent>> {
        let mut logs = self.logs.lock().expect("event store poisoned");
        if let Some(log) = logs.get(world_id) {
            return Ok(log.clone());
        }
        let path = self.root.join(format!("{}.jsonl", world_id));
        let log = DurableLog::open(path).map_err(AgentWorldError::from)?;
        logs.insert(world_id.to_string(), log.clone());
        Ok(log)
    }

    fn all_events(&self, world_id: &str) -> Result<Vec<StoredEvent>> {
        let log = self.log_for(world_id)?;
        Ok(log
            .read_all()
            .into_iter()
            .map(|record| {
                let mut event = record.payload;
                event.seq = record.seq;
                event
            })
            .collect())
    }
}

impl EventStore for FileEventStore {
    fn save_event(&self, mut event: StoredEvent) -> Result<StoredEvent> {
        let log = self.log_for(&event.world_id)?;
        if let Some(message_id) = event.message_id.clone() {
            if let Some(existing) = self
                .all_events(&event.world_id)?
                .into_iter()
                .find(|e| e.message_id.as_deref() == Some(message_id.as_str()))
            {
                return Ok(existing);
            }
        }
        event.seq = 0; // placeholder; the log assigns the authoritative seq
        let record = log.append(event).map_err(AgentWorldError::from)?;
        let mut stored = record.payload;
        stored.seq = record.seq;
        Ok(stored)
    }

    fn get_events(&self, world_id: &str, filter: &EventFilter) -> Result<Vec<StoredEvent>> {
        let mut out: Vec<StoredEvent> = self
            .all_events(world_id)?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn remove_messages_from(&self, world_id: &str, chat_id: Option<&str>, message_id: &str) -> Result<RemoveOutcome> {
        let events = self.all_events(world_id)?;
        let cut_seq = events
            .iter()
            .find(|e| e.message_id.as_deref() == Some(message_id) && e.chat_id.as_deref() == chat_id)
            .map(|e| e.seq);
        let Some(cut_seq) = cut_seq else {
            return Err(AgentWorldError::NotFound(format!("message {} not found", message_id)));
        };
        let log = self.log_for(world_id)?;
        let removed = log.truncate_from(cut_seq).map_err(AgentWorldError::from)?;
        let removed_in_chat = removed
            .into_iter()
            .filter(|r| r.payload.chat_id.as_deref() == chat_id)
            .count();
        Ok(RemoveOutcome {
            removed: removed_in_chat,
            failed_agents: Vec::new(),
        })
    }

    fn branch_chat_from_message(
        &self,
        world_id: &str,
        source_chat_id: &str,
        message_id: &str,
        new_chat_id: &str,
    ) -> Result<Vec<StoredEvent>> {
        let events = self.all_events(world_id)?;
        let cut_seq = events
            .iter()
            .find(|e| e.chat_id.as_deref() == Some(source_chat_id) && e.message_id.as_deref() == Some(message_id))
            .map(|e| e.seq);
        let Some(cut_seq) = cut_seq else {
            return Err(AgentWorldError::NotFound(format!("message {} not found", message_id)));
        };
        let log = self.log_for(world_id)?;
        let mut copied = Vec::new();
        // Rolls back by truncating away anything we already appended if a
        // later copy fails, so a branch never leaves a partial chat behind
        //.
        let rollback_from = log.next_seq();
        for event in events.into_iter().filter(|e| e.chat_id.as_deref() == Some(source_chat_id) && e.seq <= cut_seq) {
            let mut branched = event;
            branched.chat_id = Some(new_chat_id.to_string());
            branched.world_id = world_id.to_string();
            branched.seq = 0;
            match log.append(branched) {
                Ok(record) => {
                    let mut stored = record.payload;
                    stored.seq = record.seq;
                    copied.push(stored);
                }
                Err(e) => {
                    let _ = log.truncate_from(rollback_from);
                    return Err(AgentWorldError::from(e));
                }
            }
        }
        Ok(copied)
    }

    fn next_seq(&self, world_id: &str) -> u64 {
        self.log_for(world_id).map(|log| log.next_seq()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageMetadata;
    use chrono::Utc;

    fn make_event(world_id: &str, chat_id: &str, message_id: &str) -> StoredEvent {
        StoredEvent {
            id: format!("evt-{}", message_id),
            world_id: world_id.to_string(),
            chat_id: Some(chat_id.to_string()),
            kind: EventKind::Message,
            seq: 0,
            created_at: Utc::now(),
            message_id: Some(message_id.to_string()),
            sender: Some("human".to_string()),
            role: Some(crate::model::Role::User),
            content: Some("hi".to_string()),
            reply_to_message_id: None,
            tool_calls: None,
            tool_call_id: None,
            metadata: Some(MessageMetadata {
                owner_agent_ids: vec!["agent-1".to_string()],
                recipient_agent_id: None,
                direction: crate::model::Direction::HumanToAgent,
                is_memory_only: false,
                is_cross_agent: false,
                thread_root_id: message_id.to_string(),
                thread_depth: 0,
                has_tool_calls: false,
            }),
        }
    }

    #[test]
    fn memory_store_assigns_monotonic_seq() {
        let store = MemoryEventStore::new();
        let e1 = store.save_event(make_event("w1", "c1", "m1")).unwrap();
        let e2 = store.save_event(make_event("w1", "c1", "m2")).unwrap();
        assert_eq!(e1.seq, 0);
        assert_eq!(e2.seq, 1);
    }

    #[test]
    fn memory_store_dedupes_by_message_id() {
        let store = MemoryEventStore::new();
        let first = store.save_event(make_event("w1", "c1", "m1")).unwrap();
        let second = store.save_event(make_event("w1", "c1", "m1")).unwrap();
        assert_eq!(first.seq, second.seq);
        assert_eq!(store.next_seq("w1"), 1);
    }

    #[test]
    fn memory_store_filters_by_owner() {
        let store = MemoryEventStore::new();
        store.save_event(make_event("w1", "c1", "m1")).unwrap();
        let mut other = make_event("w1", "c1", "m2");
        other.metadata.as_mut().unwrap().owner_agent_ids = vec!["agent-2".to_string()];
        store.save_event(other).unwrap();

        let filter = EventFilter {
            owner_agent_id: Some("agent-1".to_string()),
            ..Default::default()
        };
        let results = store.get_events("w1", &filter).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message_id.as_deref(), Some("m1"));
    }

    #[test]
    fn remove_messages_from_truncates_chat_tail() {
        let store = MemoryEventStore::new();
        store.save_event(make_event("w1", "c1", "m1")).unwrap();
        store.save_event(make_event("w1", "c1", "m2")).unwrap();
        store.save_event(make_event("w1", "c1", "m3")).unwrap();
        let outcome = store.remove_messages_from("w1", Some("c1"), "m2").unwrap();
        assert_eq!(outcome.removed, 2);
        let remaining = store.get_events("w1", &EventFilter::default()).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message_id.as_deref(), Some("m1"));
    }

    #[test]
    fn branch_chat_copies_prefix_into_new_chat() {
        let store = MemoryEventStore::new();
        store.save_event(make_event("w1", "c1", "m1")).unwrap();
        store.save_event(make_event("w1", "c1", "m2")).unwrap();
        store.save_event(make_event("w1", "c1", "m3")).unwrap();
        let copied = store.branch_chat_from_message("w1", "c1", "m2", "c2").unwrap();
        assert_eq!(copied.len(), 2);
        assert!(copied.iter().all(|e| e.chat_id.as_deref() == Some("c2")));
        let filter = EventFilter {
            chat_id: Some("c2".to_string()),
            ..Default::default()
        };
        assert_eq!(store.get_events("w1", &filter).unwrap().len(), 2);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileEventStore::new(dir.path());
            store.save_event(make_event("w1", "c1", "m1")).unwrap();
        }
        let store = FileEventStore::new(dir.path());
        let events = store.get_events("w1", &EventFilter::default()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message_id.as_deref(), Some("m1"));
    }
}
