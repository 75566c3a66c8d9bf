//! Per-agent memory: append path, LLM-context filtering, reply threading.
//!
//! An agent's `memory` (`Agent::memory`) is its own copy of every message
//! event it owns, with `role` reinterpreted from *its* point of view: the
//! canonical event store row records who actually sent a message, but two
//! agents can disagree on whether that makes it a `user` or `assistant` turn
//! (an agent-to-agent message is an `assistant` turn for its sender's memory
//! and a `user` turn for its recipient's). This module derives each agent's
//! view from the canonical row rather than storing per-agent duplicates in
//! the event store itself, which stays canonical and single-writer.

use crate::model::{Direction, Role, StoredEvent};
use std::collections::{HashMap, HashSet};

/// Maximum hops walked when resolving a reply chain's root, capped at 100.
/// Circular references abort at the first revisited id and fall back to
/// treating the message as its own root.
const MAX_THREAD_WALK: usize = 100;

/// For each owning agent, derive that agent's role-adjusted view of a
/// canonical stored event and append it to `memories[owner]` unless a row
/// with the same `message_id` is already present (deduplicates by
/// `(ownerAgentId, messageId)`).
pub fn append_to_owners(
    canonical: &StoredEvent,
    owners: &[String],
    memories: &mut HashMap<String, Vec<StoredEvent>>,
) {
    let message_id = match &canonical.message_id {
        Some(id) => id.clone(),
        None => return,
    };
    for owner in owners {
        let memory = memories.entry(owner.clone()).or_insert_with(Vec::new);
        let already_present = memory
            .iter()
            .any(|e| e.message_id.as_deref() == Some(message_id.as_str()));
        if already_present {
            continue;
        }
        let mut row = canonical.clone();
        row.role = Some(role_for_owner(canonical, owner));
        memory.push(row);
    }
}

fn role_for_owner(canonical: &StoredEvent, owner: &str) -> Role {
    match canonical.sender.as_deref() {
        Some(sender) if sender == owner => Role::Assistant,
        _ => match canonical.role {
            Some(Role::System) => Role::System,
            Some(Role::Tool) => Role::Tool,
            _ => Role::User,
        },
    }
}

/// Filter an agent's memory down to a sequence the LLM API will accept
///. Two passes:
///
/// 1. Strip `client.*` tool calls from assistant messages (the client, not
///    the LLM, answers those); drop the assistant message entirely if that
///    empties both its `tool_calls` and `content`.
/// 2. Drop every `role: tool` row whose `tool_call_id` is missing, belongs to
///    a removed `client.*` call, or doesn't match any surviving tool call at
///    all (a legacy/orphaned row) — this is what keeps "every tool message
///    must follow a matching tool_calls entry" APIs happy.
///
/// Persisted stdout-capture artifacts (`messageId` suffixed `-stdout`) are
/// dropped from relevance entirely; they exist for transport/audit, not for
/// LLM context.
pub fn filter_client_side_messages(memory: &[StoredEvent]) -> Vec<StoredEvent> {
    let mut removed_tool_call_ids: HashSet<String> = HashSet::new();
    let mut valid_tool_call_ids: HashSet<String> = HashSet::new();

    // Pass 1: classify tool_call ids and rebuild assistant rows with
    // client.* calls stripped.
    let mut pass1: Vec<StoredEvent> = Vec::with_capacity(memory.len());
    for event in memory {
        if is_stdout_capture(event) {
            continue;
        }
        if event.role != Some(Role::Assistant) {
            pass1.push(event.clone());
            continue;
        }
        match &event.tool_calls {
            None => pass1.push(event.clone()),
            Some(calls) => {
                let mut kept = Vec::with_capacity(calls.len());
                for call in calls {
                    if call.is_client_side() {
                        removed_tool_call_ids.insert(call.id.clone());
                    } else {
                        valid_tool_call_ids.insert(call.id.clone());
                        kept.push(call.clone());
                    }
                }
                let content_empty = event
                    .content
                    .as_deref()
                    .map(|c| c.trim().is_empty())
                    .unwrap_or(true);
                if kept.is_empty() && content_empty {
                    continue; // drop the whole assistant message
                }
                let mut row = event.clone();
                row.tool_calls = if kept.is_empty() { None } else { Some(kept) };
                pass1.push(row);
            }
        }
    }

    // Pass 2: drop orphaned / removed tool rows.
    pass1
        .into_iter()
        .filter(|event| {
            if event.role != Some(Role::Tool) {
                return true;
            }
            match &event.tool_call_id {
                None => false,
                Some(id) => {
                    !removed_tool_call_ids.contains(id) && valid_tool_call_ids.contains(id)
                }
            }
        })
        .collect()
}

fn is_stdout_capture(event: &StoredEvent) -> bool {
    event
        .message_id
        .as_deref()
        .map(|id| id.ends_with("-stdout"))
        .unwrap_or(false)
}

/// Resolve `(thread_root_id, thread_depth)` for a new message replying to
/// `reply_to_message_id`, walking `events` (assumed to be one chat's worth,
/// indexed by `message_id`). A message with no `reply_to_message_id` is its
/// own root at depth 0.
pub fn resolve_thread(
    message_id: &str,
    reply_to_message_id: Option<&str>,
    by_message_id: &HashMap<String, StoredEvent>,
) -> (String, u32) {
    let mut current = match reply_to_message_id {
        None => return (message_id.to_string(), 0),
        Some(id) => id.to_string(),
    };
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(message_id.to_string());
    let mut depth: u32 = 1;

    loop {
        if visited.contains(&current) {
            // circular reference: fall back to self-root.
            return (message_id.to_string(), 0);
        }
        visited.insert(current.clone());
        match by_message_id.get(&current) {
            None => return (current, depth),
            Some(parent) => match &parent.reply_to_message_id {
                None => return (current, depth),
                Some(next) => {
                    if depth as usize >= MAX_THREAD_WALK {
                        return (current, depth);
                    }
                    current = next.clone();
                    depth += 1;
                }
            },
        }
    }
}

/// Map a (sender-is-agent?, recipient-is-agent?) pair onto a `Direction`.
pub fn direction_for(sender_is_agent: bool, recipient_is_agent: Option<bool>) -> Direction {
    match (sender_is_agent, recipient_is_agent) {
        (false, _) => Direction::HumanToAgent,
        (true, Some(true)) => Direction::AgentToAgent,
        (true, _) => Direction::AgentToHuman,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventKind, MessageMetadata, ToolCall, ToolCallFunction};
    use chrono::Utc;

    fn base_event(message_id: &str) -> StoredEvent {
        StoredEvent {
            id: format!("evt-{}", message_id),
            world_id: "w1".into(),
            chat_id: Some("c1".into()),
            kind: EventKind::Message,
            seq: 0,
            created_at: Utc::now(),
            message_id: Some(message_id.to_string()),
            sender: Some("a1".into()),
            role: Some(Role::Assistant),
            content: Some(String::new()),
            reply_to_message_id: None,
            tool_calls: None,
            tool_call_id: None,
            metadata: None,
        }
    }

    #[test]
    fn dedup_by_owner_and_message_id() {
        let canonical = base_event("m1");
        let mut memories = HashMap::new();
        append_to_owners(&canonical, &["a2".to_string()], &mut memories);
        append_to_owners(&canonical, &["a2".to_string()], &mut memories);
        assert_eq!(memories["a2"].len(), 1);
    }

    #[test]
    fn role_flips_for_non_sender_owner() {
        let canonical = base_event("m1");
        let mut memories = HashMap::new();
        append_to_owners(&canonical, &["a1".to_string(), "a2".to_string()], &mut memories);
        assert_eq!(memories["a1"][0].role, Some(Role::Assistant));
        assert_eq!(memories["a2"][0].role, Some(Role::User));
    }

    #[test]
    fn filter_drops_client_side_calls_and_orphan_results_s5() {
        let mut assistant = base_event("m1");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "c1".into(),
            call_type: "function".into(),
            function: ToolCallFunction {
                name: "client.requestApproval".into(),
                arguments: serde_json::json!({}),
            },
        }]);
        let mut tool_result = base_event("m2");
        tool_result.role = Some(Role::Tool);
        tool_result.tool_call_id = Some("c1".into());
        tool_result.content = Some(
            serde_json::json!({
                "__type": "tool_result",
                "decision": "approve",
                "scope": "once",
                "toolName": "shell_cmd"
            })
            .to_string(),
        );

        let filtered = filter_client_side_messages(&[assistant, tool_result]);
        assert!(filtered.is_empty(), "both rows should be elided per S5");
    }

    #[test]
    fn filter_keeps_valid_tool_round_trip() {
        let mut assistant = base_event("m1");
        assistant.content = Some("calling a tool".into());
        assistant.tool_calls = Some(vec![ToolCall {
            id: "c1".into(),
            call_type: "function".into(),
            function: ToolCallFunction {
                name: "shell_cmd".into(),
                arguments: serde_json::json!({"command": "ls"}),
            },
        }]);
        let mut tool_result = base_event("m2");
        tool_result.role = Some(Role::Tool);
        tool_result.tool_call_id = Some("c1".into());
        tool_result.content = Some("ok".into());

        let filtered = filter_client_side_messages(&[assistant, tool_result]);
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn filter_drops_stdout_capture_artifacts() {
        let mut stdout_row = base_event("m1-stdout");
        stdout_row.role = Some(Role::Assistant);
        stdout_row.content = Some("captured output".into());
        let filtered = filter_client_side_messages(&[stdout_row]);
        assert!(filtered.is_empty());
    }

    #[test]
    fn thread_root_walks_up_to_root() {
        let mut by_id = HashMap::new();
        let mut root = base_event("root");
        root.reply_to_message_id = None;
        by_id.insert("root".to_string(), root);
        let mut mid = base_event("mid");
        mid.reply_to_message_id = Some("root".to_string());
        by_id.insert("mid".to_string(), mid);

        let (root_id, depth) = resolve_thread("leaf", Some("mid"), &by_id);
        assert_eq!(root_id, "root");
        assert_eq!(depth, 2);
    }

    #[test]
    fn thread_root_self_when_no_parent() {
        let by_id = HashMap::new();
        let (root_id, depth) = resolve_thread("m1", None, &by_id);
        assert_eq!(root_id, "m1");
        assert_eq!(depth, 0);
    }

    #[test]
    fn thread_root_aborts_on_circular_reference() {
        let mut by_id = HashMap::new();
        let mut a = base_event("a");
        a.reply_to_message_id = Some("b".to_string());
        by_id.insert("a".to_string(), a);
        let mut b = base_event("b");
        b.reply_to_message_id = Some("a".to_string());
        by_id.insert("b".to_string(), b);

        let (root_id, depth) = resolve_thread("leaf", Some("a"), &by_id);
        assert_eq!(root_id, "leaf");
        assert_eq!(depth, 0);
    }
}
