//! Approval state machine reconstruction.
//!
//! There is no separate approval table. A tool call's approval state is
//! derived each orchestrator tick by scanning the chat's memory for
//! `client.requestApproval` synthetic calls and their matching tool results.
//! This keeps branching trivial: a branched chat carries exactly the
//! approvals in its truncated prefix, with no separate table to reconcile.

use crate::model::{ApprovalDecision, ApprovalRecord, ApprovalScope, Role, StoredEvent};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub const CLIENT_REQUEST_APPROVAL: &str = "client.requestApproval";

fn hash_args(args: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(args).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

/// Scans one chat's worth of memory (never cross-chat) and reconstructs
/// every approval decision a client has submitted so far.
pub fn scan_approvals(chat_memory: &[StoredEvent]) -> Vec<ApprovalRecord> {
    // First pass: map synthetic client.requestApproval call id -> the
    // original tool call it was requesting approval for.
    let mut synthetic_to_original: HashMap<String, (String, serde_json::Value)> = HashMap::new();
    for event in chat_memory {
        if event.role != Some(Role::Assistant) {
            continue;
        }
        let Some(calls) = &event.tool_calls else {
            continue;
        };
        for call in calls {
            if call.function.name != CLIENT_REQUEST_APPROVAL {
                continue;
            }
            let Some(original) = call.function.arguments.get("originalToolCall") else {
                continue;
            };
            let Some(name) = original.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(id) = original.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let args = original.get("args").cloned().unwrap_or(serde_json::Value::Null);
            synthetic_to_original.insert(call.id.clone(), (id.to_string(), args));
            let _ = name; // tool name is re-read from the tool_result content below
        }
    }

    // Second pass: every tool_result answering one of those synthetic calls
    // is an approval decision.
    let mut records = Vec::new();
    for event in chat_memory {
        if event.role != Some(Role::Tool) {
            continue;
        }
        let Some(synthetic_id) = &event.tool_call_id else {
            continue;
        };
        let Some((original_id, original_args)) = synthetic_to_original.get(synthetic_id) else {
            continue;
        };
        let Some(content) = &event.content else {
            continue;
        };
        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(content) else {
            continue;
        };
        if parsed.get("__type").and_then(|v| v.as_str()) != Some("tool_result") {
            continue;
        }
        let tool_name = parsed
            .get("toolName")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let decision_str = parsed.get("decision").and_then(|v| v.as_str()).unwrap_or("deny");
        let scope_str = parsed.get("scope").and_then(|v| v.as_str()).unwrap_or("none");
        let decision = match decision_str {
            "approve" => match scope_str {
                "session" => ApprovalDecision::Approve(ApprovalScope::Session),
                _ => ApprovalDecision::Approve(ApprovalScope::Once),
            },
            _ => ApprovalDecision::Deny,
        };
        let args_for_hash = parsed.get("toolArgs").cloned().unwrap_or(original_args.clone());
        records.push(ApprovalRecord {
            chat_id: event.chat_id.clone(),
            tool_name,
            args_hash: hash_args(&args_for_hash),
            decision,
            timestamp: event.created_at,
            original_tool_call_id: original_id.clone(),
        });
    }
    records
}

/// Resolves whether `tool_name`/`original_tool_call_id` is currently
/// approved, following the matching rules of step 4.
/// `None` means no approval has been recorded yet (the caller should emit a
/// fresh `client.requestApproval`).
pub fn resolve_approval(
    approvals: &[ApprovalRecord],
    tool_name: &str,
    original_tool_call_id: &str,
) -> Option<ApprovalDecision> {
    if let Some(rec) = approvals
        .iter()
        .rev()
        .find(|a| a.original_tool_call_id == original_tool_call_id)
    {
        return Some(rec.decision.clone());
    }
    approvals
        .iter()
        .rev()
        .find(|a| a.tool_name == tool_name && a.decision == ApprovalDecision::Approve(ApprovalScope::Session))
        .map(|a| a.decision.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventKind, ToolCall, ToolCallFunction};
    use chrono::Utc;

    fn base(message_id: &str) -> StoredEvent {
        StoredEvent {
            id: format!("evt-{}", message_id),
            world_id: "w1".into(),
            chat_id: Some("c1".into()),
            kind: EventKind::Message,
            seq: 0,
            created_at: Utc::now(),
            message_id: Some(message_id.to_string()),
            sender: Some("a1".into()),
            role: None,
            content: None,
            reply_to_message_id: None,
            tool_calls: None,
            tool_call_id: None,
            metadata: None,
        }
    }

    fn approval_request(original_call_id: &str) -> StoredEvent {
        let mut e = base("m1");
        e.role = Some(Role::Assistant);
        e.tool_calls = Some(vec![ToolCall {
            id: "req1".into(),
            call_type: "function".into(),
            function: ToolCallFunction {
                name: CLIENT_REQUEST_APPROVAL.into(),
                arguments: serde_json::json!({
                    "originalToolCall": {"id": original_call_id, "name": "shell_cmd", "args": {"command": "ls"}},
                    "message": "approve?",
                    "options": ["deny", "approve_once", "approve_session"],
                }),
            },
        }]);
        e
    }

    fn approval_response(scope: &str, decision: &str) -> StoredEvent {
        let mut e = base("m2");
        e.role = Some(Role::Tool);
        e.tool_call_id = Some("req1".into());
        e.content = Some(
            serde_json::json!({
                "__type": "tool_result",
                "decision": decision,
                "scope": scope,
                "toolName": "shell_cmd",
                "toolArgs": {"command": "ls"},
            })
            .to_string(),
        );
        e
    }

    #[test]
    fn once_scope_matches_only_its_own_call_s3() {
        let memory = vec![approval_request("call_1"), approval_response("once", "approve")];
        let approvals = scan_approvals(&memory);
        assert_eq!(approvals.len(), 1);
        assert_eq!(
            resolve_approval(&approvals, "shell_cmd", "call_1"),
            Some(ApprovalDecision::Approve(ApprovalScope::Once))
        );
        // A second, distinct call id gets nothing: fresh approval required.
        assert_eq!(resolve_approval(&approvals, "shell_cmd", "call_2"), None);
    }

    #[test]
    fn session_scope_matches_any_future_call_with_same_name_s4() {
        let memory = vec![approval_request("call_1"), approval_response("session", "approve")];
        let approvals = scan_approvals(&memory);
        assert_eq!(
            resolve_approval(&approvals, "shell_cmd", "call_2"),
            Some(ApprovalDecision::Approve(ApprovalScope::Session))
        );
        assert_eq!(resolve_approval(&approvals, "other_tool", "call_3"), None);
    }

    #[test]
    fn deny_is_permanent_for_that_specific_call() {
        let memory = vec![approval_request("call_1"), approval_response("none", "deny")];
        let approvals = scan_approvals(&memory);
        assert_eq!(
            resolve_approval(&approvals, "shell_cmd", "call_1"),
            Some(ApprovalDecision::Deny)
        );
        assert_eq!(resolve_approval(&approvals, "shell_cmd", "call_2"), None);
    }
}
