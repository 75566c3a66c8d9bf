//! Agent turn orchestrator.
//!
//! Per incoming message, decides which registered agents reply and drives
//! one provider call per eligible agent — fanning out to every agent a
//! mention-routing rule set (see `should_agent_respond`/`route_message`)
//! judges eligible, rather than a single next-in-line participant, and
//! threading a tool-execution/approval loop through each turn instead of a
//! single plain completion.

use crate::config::AgentWorldConfig;
use crate::error::{AgentWorldError, Result};
use crate::event_bus::{BusPayload, Channel, SseEnvelope, SseEventKind, SystemMessage, Usage};
use crate::memory::filter_client_side_messages;
use crate::model::{Agent, Role, StoredEvent, ToolCall};
use crate::provider::{LlmMessage, LlmParams, LlmProvider, StreamEvent};
use crate::store::EventStore;
use crate::tools::{self, approval, skill, Dispatch, ToolRegistry};
use crate::world::{PublishOptions, World};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of evaluating the seven should-agent-respond rules for one agent
/// against one incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespondDecision {
    /// The agent gets a turn.
    Accept,
    /// The message still lands in the agent's memory, but it does not reply.
    MemoryOnly,
    /// The agent neither replies nor records the message.
    Reject,
    /// The agent would otherwise reply, but has exhausted its turn budget.
    TurnLimitReached,
}

fn is_mention_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Extracts `@token` mentions from `content`:
/// an `@` preceded by whitespace/punctuation or string-start, followed by a
/// run of id-safe characters.
pub fn extract_mentions(content: &str) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    let mut mentions = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '@' {
            let boundary_ok = i == 0 || {
                let prev = chars[i - 1];
                prev.is_whitespace() || (prev.is_ascii_punctuation() && prev != '@')
            };
            let mut j = i + 1;
            while j < chars.len() && is_mention_char(chars[j]) {
                j += 1;
            }
            if boundary_ok && j > i + 1 {
                mentions.push(chars[i + 1..j].iter().collect());
            }
            i = j.max(i + 1);
        } else {
            i += 1;
        }
    }
    mentions
}

/// Evaluates the seven ordered rules of for one agent
/// against one incoming message.
pub fn should_agent_respond(
    agent: &Agent,
    current_chat_id: Option<&str>,
    message_chat_id: Option<&str>,
    sender_id: &str,
    sender_is_agent: bool,
    content: &str,
) -> RespondDecision {
    // 1. an agent never replies to its own message.
    if sender_id == agent.id {
        return RespondDecision::Reject;
    }
    // 2. a message scoped to a different chat than the world's current chat
    // is not this agent's concern.
    if let (Some(msg_chat), Some(current)) = (message_chat_id, current_chat_id) {
        if msg_chat != current {
            return RespondDecision::Reject;
        }
    }

    let mentions = extract_mentions(content);
    let is_mentioned = mentions.iter().any(|m| agent.matches_mention(m));

    // 3. autoReply disabled and not mentioned: not this agent's concern at all.
    if !agent.auto_reply && !is_mentioned {
        return RespondDecision::Reject;
    }
    // 4. mentions exist and name other agents only: absorbed into memory, no reply.
    if !mentions.is_empty() && !is_mentioned {
        return RespondDecision::MemoryOnly;
    }
    // 5. no mentions at all and the sender is itself an agent: a broadcast,
    // absorbed into memory rather than triggering a reply chain.
    if mentions.is_empty() && sender_is_agent {
        return RespondDecision::MemoryOnly;
    }
    // 6. turn budget exhausted.
    if agent.at_turn_limit() {
        return RespondDecision::TurnLimitReached;
    }
    // 7. everything else (a direct/broadcast human message, or an explicit
    // mention) earns a turn.
    RespondDecision::Accept
}

/// Per-message routing outcome across every agent in a world.
#[derive(Debug, Clone, Default)]
pub struct RoutingResult {
    pub owner_agent_ids: Vec<String>,
    pub turn_agent_ids: Vec<String>,
    pub turn_limited_agent_ids: Vec<(String, u32)>,
}

/// Runs `should_agent_respond` for every agent currently in `world` against
/// one incoming message, producing the owner/turn-eligible split
/// `World::publish_message` needs.
pub fn route_message(
    world: &World,
    sender_id: &str,
    sender_is_agent: bool,
    content: &str,
    message_chat_id: Option<&str>,
) -> RoutingResult {
    let current_chat_id = world.current_chat_id.lock().expect("current chat poisoned").clone();
    let agents = world.agents.lock().expect("world agents poisoned");
    let mut result = RoutingResult::default();
    for agent in agents.values() {
        match should_agent_respond(
            agent,
            current_chat_id.as_deref(),
            message_chat_id,
            sender_id,
            sender_is_agent,
            content,
        ) {
            RespondDecision::Accept => {
                result.owner_agent_ids.push(agent.id.clone());
                result.turn_agent_ids.push(agent.id.clone());
            }
            RespondDecision::MemoryOnly => result.owner_agent_ids.push(agent.id.clone()),
            RespondDecision::TurnLimitReached => {
                result.owner_agent_ids.push(agent.id.clone());
                result.turn_limited_agent_ids.push((agent.id.clone(), agent.llm_call_limit));
            }
            RespondDecision::Reject => {}
        }
    }
    result
}

fn stored_to_llm_message(event: &StoredEvent) -> Option<LlmMessage> {
    let role = event.role?;
    Some(LlmMessage {
        role,
        content: event.content.clone().unwrap_or_default(),
        tool_calls: event.tool_calls.clone().unwrap_or_default(),
        tool_call_id: event.tool_call_id.clone(),
    })
}

/// Builds the system prompt's skills/working-directory suffix: the agent's
/// own `system_prompt`, then the world's working directory, then the
/// `<available_skills>` block.
fn build_system_message(agent: &Agent, working_directory: &str, tools: &ToolRegistry) -> LlmMessage {
    let mut text = agent.system_prompt.clone();
    if !text.is_empty() {
        text.push_str("\n\n");
    }
    text.push_str(&format!("Your working directory is {}.\n\n", working_directory));
    text.push_str(&tools.skills.available_skills_block());
    LlmMessage::system(text)
}

/// Outcome of running one built-in/MCP tool to completion.
enum BuiltinOutcome {
    Completed(serde_json::Value),
    /// The tool enqueued work that resolves asynchronously (a HITL prompt);
    /// the turn stops here rather than feeding back a synthetic result.
    Pending,
    Errored(String),
}

/// Drives should-agent-respond-accepted agents through the full turn
/// lifecycle: LLM streaming, tool execution and approval gating, and
/// turn-limit/failure handling.
pub struct Orchestrator<S: EventStore> {
    pub world: Arc<World>,
    pub store: Arc<S>,
    pub providers: HashMap<String, Arc<dyn LlmProvider>>,
    pub tools: tokio::sync::Mutex<ToolRegistry>,
    pub config: AgentWorldConfig,
}

impl<S: EventStore + Send + Sync + 'static> Orchestrator<S> {
    pub fn new(world: Arc<World>, store: Arc<S>, config: AgentWorldConfig) -> Self {
        Self {
            world,
            store,
            providers: HashMap::new(),
            tools: tokio::sync::Mutex::new(ToolRegistry::new()),
            config,
        }
    }

    pub fn register_provider(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.provider_name().to_string(), provider);
    }

    /// Entry point for a newly-arrived human or agent-originated message.
    /// Persists the canonical event, then fires a detached turn for every
    /// agent `should_agent_respond` accepted.
    pub async fn process_incoming_message(
        self: &Arc<Self>,
        content: impl Into<String>,
        sender_id: impl Into<String>,
        sender_is_agent: bool,
        chat_id: Option<String>,
    ) -> Result<StoredEvent> {
        let content = content.into();
        let sender_id = sender_id.into();
        let routing = route_message(&self.world, &sender_id, sender_is_agent, &content, chat_id.as_deref());

        for (agent_id, limit) in &routing.turn_limited_agent_ids {
            self.world.publish_system(SystemMessage::warn(
                "turn_limit",
                AgentWorldError::TurnLimit {
                    agent_id: agent_id.clone(),
                    limit: *limit,
                }
                .to_string(),
            ));
        }

        let options = PublishOptions {
            chat_id,
            owner_agent_ids: Some(routing.owner_agent_ids.clone()),
            is_memory_only: routing.turn_agent_ids.is_empty(),
            ..Default::default()
        };
        // `World::publish_message` stamps agent memory and schedules (but
        // does not run) bus handlers synchronously; persisting here, before
        // any spawned handler gets a chance to execute, keeps writes ordered
        // ahead of emission.
        let event = self.world.publish_message(content, sender_id, sender_is_agent, options);
        let event = self.store.save_event(event)?;

        for agent_id in routing.turn_agent_ids {
            let orchestrator = Arc::clone(self);
            let trigger = event.clone();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.run_agent_turn(agent_id.clone(), trigger).await {
                    log::warn!("agent '{}' turn ended in error: {}", agent_id, e);
                }
            });
        }

        Ok(event)
    }

    /// Appends `event` to exactly one agent's memory and the event store,
    /// without broadcasting it on `Channel::Message` — used for the private
    /// assistant/tool rows a tool-execution loop produces mid-turn, which
    /// are never routing decisions for other agents.
    fn persist_private(&self, agent_id: &str, mut event: StoredEvent) -> Result<StoredEvent> {
        event.world_id = self.world.id();
        event = self.store.save_event(event)?;
        let mut agents = self.world.agents.lock().expect("world agents poisoned");
        if let Some(agent) = agents.get_mut(agent_id) {
            agent.memory.push(event.clone());
        }
        Ok(event)
    }

    fn snapshot_agent(&self, agent_id: &str) -> Option<Agent> {
        self.world.agents.lock().expect("world agents poisoned").get(agent_id).cloned()
    }

    fn emit_sse(&self, agent_name: &str, reply_message_id: &str, kind: SseEventKind) {
        let envelope = SseEnvelope::new(agent_name, kind).with_message_id(reply_message_id);
        self.world.bus.publish(Channel::Sse, BusPayload::Sse(envelope));
        self.world.activity_notify.notify_waiters();
    }

    /// Runs one complete turn for `agent_id`: streams from its provider,
    /// executes any tools it calls (with approval gating), and loops back
    /// into another streaming round until the model stops calling tools,
    /// the turn limit is hit, or a tool leaves the turn waiting on a
    /// client/human response.
    pub async fn run_agent_turn(self: Arc<Self>, agent_id: String, trigger: StoredEvent) -> Result<()> {
        self.world.activity.begin();
        let result = Arc::clone(&self).run_agent_turn_inner(agent_id, trigger).await;
        self.world.activity.complete();
        self.world.activity_notify.notify_waiters();
        result
    }

    async fn run_agent_turn_inner(self: Arc<Self>, agent_id: String, trigger: StoredEvent) -> Result<()> {
        let agent_id = agent_id.as_str();
        let trigger = &trigger;
        let Some(mut agent) = self.snapshot_agent(agent_id) else {
            return Err(AgentWorldError::NotFound(format!("agent '{}'", agent_id)));
        };
        let Some(provider) = self.providers.get(&agent.provider).cloned() else {
            let msg = format!("no provider registered for '{}'", agent.provider);
            self.world.publish_system(SystemMessage::warn("provider", msg.clone()));
            return Err(AgentWorldError::Provider(msg));
        };

        let working_directory = self.world.config.lock().expect("world config poisoned").working_directory.clone();
        let reply_message_id = Uuid::new_v4().to_string();
        let tool_defs = self.tools.lock().await.tool_definitions().await;
        let params = LlmParams {
            temperature: agent.temperature,
            max_tokens: agent.max_tokens,
        };

        self.emit_sse(
            &agent.id,
            &reply_message_id,
            SseEventKind::Start {
                sender: agent.id.clone(),
                world_name: self.world.config.lock().expect("world config poisoned").name.clone(),
            },
        );

        let mut turn_content = String::new();
        let mut turn_usage = Usage::default();

        loop {
            if agent.at_turn_limit() {
                self.world.publish_system(SystemMessage::warn(
                    "turn_limit",
                    AgentWorldError::TurnLimit {
                        agent_id: agent.id.clone(),
                        limit: agent.llm_call_limit,
                    }
                    .to_string(),
                ));
                return Ok(());
            }

            let system_message = {
                let tools = self.tools.lock().await;
                build_system_message(&agent, &working_directory, &tools)
            };
            let mut messages: Vec<LlmMessage> = vec![system_message];
            messages.extend(
                filter_client_side_messages(&agent.memory)
                    .iter()
                    .filter_map(stored_to_llm_message),
            );

            let mut stream = match provider.stream(&agent.model, &messages, &tool_defs, &params).await {
                Ok(s) => s,
                Err(e) => {
                    // transport error: sse error + system event, no llmCallCount bump, no retry.
                    self.emit_sse(&agent.id, &reply_message_id, SseEventKind::Error { error: e.to_string() });
                    self.world.publish_system(SystemMessage::warn("provider", e.to_string()));
                    return Err(e);
                }
            };

            let mut round_content = String::new();
            let mut round_tool_calls: Vec<ToolCall> = Vec::new();
            let mut round_usage = Usage::default();
            let mut stream_error: Option<AgentWorldError> = None;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(StreamEvent::Chunk { delta }) => {
                        round_content.push_str(&delta);
                        self.emit_sse(
                            &agent.id,
                            &reply_message_id,
                            SseEventKind::Chunk {
                                content: delta,
                                sender: agent.id.clone(),
                                tool_calls: None,
                                tool_name: None,
                                stream: None,
                            },
                        );
                    }
                    Ok(StreamEvent::ToolCalls { tool_calls }) => {
                        round_tool_calls = tool_calls.clone();
                        self.emit_sse(
                            &agent.id,
                            &reply_message_id,
                            SseEventKind::Chunk {
                                content: String::new(),
                                sender: agent.id.clone(),
                                tool_calls: Some(tool_calls),
                                tool_name: None,
                                stream: None,
                            },
                        );
                    }
                    Ok(StreamEvent::End { usage, .. }) => {
                        round_usage = Usage {
                            prompt_tokens: usage.prompt_tokens,
                            completion_tokens: usage.completion_tokens,
                        };
                    }
                    Err(e) => {
                        stream_error = Some(e);
                        break;
                    }
                }
            }

            if let Some(e) = stream_error {
                self.emit_sse(&agent.id, &reply_message_id, SseEventKind::Error { error: e.to_string() });
                self.world.publish_system(SystemMessage::warn("provider", e.to_string()));
                return Err(e);
            }

            turn_content.push_str(&round_content);
            turn_usage.prompt_tokens += round_usage.prompt_tokens;
            turn_usage.completion_tokens += round_usage.completion_tokens;

            if round_tool_calls.is_empty() {
                // normal completion: bump llmCallCount, persist the final
                // assistant message, emit `end`.
                agent.llm_call_count += 1;
                {
                    let mut agents = self.world.agents.lock().expect("world agents poisoned");
                    if let Some(a) = agents.get_mut(&agent.id) {
                        a.llm_call_count = agent.llm_call_count;
                    }
                }
                let routing = route_message(
                    &self.world,
                    &agent.id,
                    true,
                    &turn_content,
                    trigger.chat_id.as_deref(),
                );
                for (limited_id, limit) in &routing.turn_limited_agent_ids {
                    self.world.publish_system(SystemMessage::warn(
                        "turn_limit",
                        AgentWorldError::TurnLimit {
                            agent_id: limited_id.clone(),
                            limit: *limit,
                        }
                        .to_string(),
                    ));
                }
                self.world.publish_message(
                    turn_content.clone(),
                    agent.id.clone(),
                    true,
                    PublishOptions {
                        message_id: Some(reply_message_id.clone()),
                        reply_to_message_id: Some(trigger.message_id.clone().unwrap_or_default()),
                        chat_id: trigger.chat_id.clone(),
                        owner_agent_ids: Some(routing.owner_agent_ids.clone()),
                        is_memory_only: routing.turn_agent_ids.is_empty(),
                        ..Default::default()
                    },
                );
                self.emit_sse(
                    &agent.id,
                    &reply_message_id,
                    SseEventKind::End {
                        content: turn_content,
                        sender: agent.id.clone(),
                        usage: turn_usage,
                    },
                );
                for next_agent_id in routing.turn_agent_ids {
                    let orchestrator = Arc::clone(&self);
                    let next_trigger = trigger.clone();
                    tokio::spawn(async move {
                        if let Err(e) = orchestrator.run_agent_turn(next_agent_id.clone(), next_trigger).await {
                            log::warn!("agent '{}' turn ended in error: {}", next_agent_id, e);
                        }
                    });
                }
                return Ok(());
            }

            // One or more tool calls: augment with synthetic approval
            // requests where needed, persist the assistant row, then decide
            // whether to stop-and-wait or execute in-process.
            let chat_rows: Vec<StoredEvent> = agent
                .memory
                .iter()
                .filter(|e| e.chat_id == trigger.chat_id)
                .cloned()
                .collect();
            let approvals = approval::scan_approvals(&chat_rows);

            let mut final_tool_calls: Vec<ToolCall> = Vec::new();
            let mut denied_ids: Vec<String> = Vec::new();
            let mut approved_ids: Vec<String> = Vec::new();
            let mut needs_stop = false;

            {
                let tools = self.tools.lock().await;
                for call in &round_tool_calls {
                    match tools.classify(call, false) {
                        Dispatch::ClientSide => {
                            final_tool_calls.push(call.clone());
                            needs_stop = true;
                        }
                        Dispatch::NeedsApproval => {
                            match approval::resolve_approval(&approvals, &call.function.name, &call.id) {
                                Some(crate::model::ApprovalDecision::Approve(_)) => {
                                    final_tool_calls.push(call.clone());
                                    approved_ids.push(call.id.clone());
                                }
                                Some(crate::model::ApprovalDecision::Deny) => {
                                    final_tool_calls.push(call.clone());
                                    denied_ids.push(call.id.clone());
                                }
                                None => {
                                    let synthetic_id = Uuid::new_v4().to_string();
                                    final_tool_calls.push(call.clone());
                                    final_tool_calls.push(tools::build_approval_request(synthetic_id, call));
                                    needs_stop = true;
                                }
                            }
                        }
                        _ => final_tool_calls.push(call.clone()),
                    }
                }
            }

            let assistant_row = StoredEvent {
                id: Uuid::new_v4().to_string(),
                world_id: self.world.id(),
                chat_id: trigger.chat_id.clone(),
                kind: crate::model::EventKind::Tool,
                seq: 0,
                created_at: chrono::Utc::now(),
                message_id: Some(Uuid::new_v4().to_string()),
                sender: Some(agent.id.clone()),
                role: Some(Role::Assistant),
                content: Some(round_content),
                reply_to_message_id: None,
                tool_calls: Some(final_tool_calls.clone()),
                tool_call_id: None,
                metadata: None,
            };
            let persisted = self.persist_private(&agent.id, assistant_row)?;
            agent.memory.push(persisted);

            if needs_stop {
                // client-side or newly-synthesized approval calls are
                // pending; the turn resumes once a matching tool_result
                // lands in this agent's memory and re-triggers it.
                return Ok(());
            }

            // Every remaining call is either approved, denied, or a
            // built-in/MCP tool with no approval requirement: execute them
            // all, serially, feeding results back for the next round.
            for call in &final_tool_calls {
                if denied_ids.contains(&call.id) {
                    let result_row = self.tool_result_row(&agent, trigger, call, serde_json::json!({"status": "denied"}));
                    let persisted = self.persist_private(&agent.id, result_row)?;
                    agent.memory.push(persisted);
                    continue;
                }

                let approved = approved_ids.contains(&call.id) || !tools::requires_approval(&call.function.name);
                let dispatch = {
                    let tools = self.tools.lock().await;
                    tools.classify(call, approved)
                };

                let outcome = self
                    .execute_builtin(dispatch, call, &agent, trigger, &working_directory, &reply_message_id)
                    .await;
                match outcome {
                    BuiltinOutcome::Completed(value) => {
                        let result_row = self.tool_result_row(&agent, trigger, call, value);
                        let persisted = self.persist_private(&agent.id, result_row)?;
                        agent.memory.push(persisted);
                    }
                    BuiltinOutcome::Pending => return Ok(()),
                    BuiltinOutcome::Errored(msg) => {
                        let result_row =
                            self.tool_result_row(&agent, trigger, call, serde_json::json!({"status": "error", "message": msg}));
                        let persisted = self.persist_private(&agent.id, result_row)?;
                        agent.memory.push(persisted);
                    }
                }
            }
            // loop back into another streaming round with the updated memory.
        }
    }

    fn tool_result_row(&self, agent: &Agent, trigger: &StoredEvent, call: &ToolCall, value: serde_json::Value) -> StoredEvent {
        StoredEvent {
            id: Uuid::new_v4().to_string(),
            world_id: self.world.id(),
            chat_id: trigger.chat_id.clone(),
            kind: crate::model::EventKind::Tool,
            seq: 0,
            created_at: chrono::Utc::now(),
            message_id: Some(Uuid::new_v4().to_string()),
            sender: Some(agent.id.clone()),
            role: Some(Role::Tool),
            content: Some(value.to_string()),
            reply_to_message_id: None,
            tool_calls: None,
            tool_call_id: Some(call.id.clone()),
            metadata: None,
        }
    }

    async fn execute_builtin(
        &self,
        dispatch: Dispatch,
        call: &ToolCall,
        agent: &Agent,
        trigger: &StoredEvent,
        working_directory: &str,
        reply_message_id: &str,
    ) -> BuiltinOutcome {
        match dispatch {
            Dispatch::RunShell => self.execute_shell(call, &agent.id, reply_message_id, working_directory).await,
            Dispatch::RunLoadSkill => self.execute_load_skill(call).await,
            Dispatch::RunCreateAgent => self.execute_create_agent(call, agent, trigger).await,
            Dispatch::RunHitlRequest => self.execute_hitl_request(call),
            Dispatch::RunMcp(source_id) => self.execute_mcp(call, &source_id).await,
            Dispatch::ClientSide | Dispatch::NeedsApproval => {
                BuiltinOutcome::Errored(format!("'{}' cannot be executed directly here", call.function.name))
            }
            Dispatch::Unknown => BuiltinOutcome::Errored(format!("unknown tool '{}'", call.function.name)),
        }
    }

    async fn execute_shell(
        &self,
        call: &ToolCall,
        agent_name: &str,
        reply_message_id: &str,
        working_directory: &str,
    ) -> BuiltinOutcome {
        let args: crate::tools::shell::ShellCmdArgs = match serde_json::from_value(call.function.arguments.clone()) {
            Ok(a) => a,
            Err(e) => return BuiltinOutcome::Errored(format!("invalid shell_cmd arguments: {}", e)),
        };
        let root = std::path::Path::new(working_directory);
        let directory = match crate::tools::shell::check_directory_scope(root, args.directory.as_deref()) {
            Ok(dir) => dir,
            Err(e) => return BuiltinOutcome::Errored(e.to_string()),
        };
        if let Err(e) = crate::tools::shell::check_scoped_arguments(&args.command, &args.parameters, root) {
            return BuiltinOutcome::Errored(e.to_string());
        }

        self.emit_sse(
            agent_name,
            reply_message_id,
            SseEventKind::ToolStart {
                tool_name: call.function.name.clone(),
                tool_call_id: call.id.clone(),
                args: call.function.arguments.clone(),
                working_directory: working_directory.to_string(),
            },
        );

        let default_timeout = self.config.shell_timeout;
        let result = crate::tools::shell::execute(&args, &directory, default_timeout).await;
        match result {
            Ok(shell_result) => {
                self.emit_sse(
                    agent_name,
                    reply_message_id,
                    SseEventKind::ToolStream {
                        tool_name: call.function.name.clone(),
                        tool_call_id: call.id.clone(),
                        stream: "stdout".to_string(),
                        content: shell_result.stdout.clone(),
                    },
                );
                if !shell_result.stderr.is_empty() {
                    self.emit_sse(
                        agent_name,
                        reply_message_id,
                        SseEventKind::ToolStream {
                            tool_name: call.function.name.clone(),
                            tool_call_id: call.id.clone(),
                            stream: "stderr".to_string(),
                            content: shell_result.stderr.clone(),
                        },
                    );
                }
                self.emit_sse(
                    agent_name,
                    reply_message_id,
                    SseEventKind::ToolEnd {
                        tool_name: call.function.name.clone(),
                        tool_call_id: call.id.clone(),
                        exit_code: shell_result.exit_code,
                        timed_out: shell_result.timed_out,
                    },
                );
                BuiltinOutcome::Completed(shell_result.to_llm_json())
            }
            Err(e) => BuiltinOutcome::Errored(e.to_string()),
        }
    }

    async fn execute_load_skill(&self, call: &ToolCall) -> BuiltinOutcome {
        let skill_id = match call.function.arguments.get("skill_id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => return BuiltinOutcome::Errored("load_skill requires a skill_id".to_string()),
        };
        let tools = self.tools.lock().await;
        match skill::load_skill(&tools.skills, &skill_id) {
            Ok(value) => BuiltinOutcome::Completed(value),
            Err(e) => BuiltinOutcome::Errored(e.to_string()),
        }
    }

    async fn execute_create_agent(&self, call: &ToolCall, agent: &Agent, trigger: &StoredEvent) -> BuiltinOutcome {
        let args: tools::CreateAgentArgs = match serde_json::from_value(call.function.arguments.clone()) {
            Ok(a) => a,
            Err(e) => return BuiltinOutcome::Errored(format!("invalid create_agent arguments: {}", e)),
        };
        let role = args.role.unwrap_or_else(|| "general assistant".to_string());
        let next_agent = args
            .next_agent
            .unwrap_or_else(|| trigger.sender.clone().unwrap_or_default());
        let prompt = tools::create_agent_system_prompt(&args.name, &role, &next_agent);

        let (default_provider, default_model, turn_limit) = {
            let config = self.world.config.lock().expect("world config poisoned");
            (config.default_provider.clone(), config.default_model.clone(), config.turn_limit)
        };
        let new_agent = Agent::new(args.name, default_provider, default_model)
            .with_system_prompt(prompt)
            .with_auto_reply(args.auto_reply.unwrap_or(true))
            .with_llm_call_limit(turn_limit);
        let created_id = new_agent.id.clone();
        let created_name = new_agent.name.clone();
        self.world.add_agent(new_agent);

        let mut metadata = HashMap::new();
        metadata.insert("refreshAfterDismiss".to_string(), serde_json::Value::Bool(true));
        metadata.insert("kind".to_string(), serde_json::Value::String("agent_created".to_string()));
        self.world.enqueue_hitl(crate::model::HitlRequest {
            request_id: Uuid::new_v4().to_string(),
            prompt: format!("Agent '{}' was created by '{}'.", created_name, agent.id),
            options: vec!["dismiss".to_string()],
            metadata,
        });

        BuiltinOutcome::Completed(serde_json::json!({
            "created": true,
            "agentId": created_id,
            "name": created_name,
        }))
    }

    fn execute_hitl_request(&self, call: &ToolCall) -> BuiltinOutcome {
        let args: tools::HitlRequestArgs = match serde_json::from_value(call.function.arguments.clone()) {
            Ok(a) => a,
            Err(e) => return BuiltinOutcome::Errored(format!("invalid hitl_request arguments: {}", e)),
        };
        if let Err(e) = tools::validate_hitl_request(&args) {
            return BuiltinOutcome::Errored(e);
        }
        self.world.enqueue_hitl(crate::model::HitlRequest {
            request_id: Uuid::new_v4().to_string(),
            prompt: args.prompt,
            options: args.options,
            metadata: HashMap::new(),
        });
        BuiltinOutcome::Pending
    }

    async fn execute_mcp(&self, call: &ToolCall, source_id: &str) -> BuiltinOutcome {
        let tools = self.tools.lock().await;
        let Some(provider) = tools.mcp.get(source_id) else {
            return BuiltinOutcome::Errored(format!("mcp source '{}' is no longer registered", source_id));
        };
        match provider.execute(&call.function.name, call.function.arguments.clone()).await {
            Ok(result) if result.success => BuiltinOutcome::Completed(result.output),
            Ok(result) => BuiltinOutcome::Errored(result.error.unwrap_or_else(|| "mcp tool failed".to_string())),
            Err(e) => BuiltinOutcome::Errored(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_mention() {
        assert_eq!(extract_mentions("hey @researcher can you look"), vec!["researcher"]);
    }

    #[test]
    fn ignores_email_like_at_signs() {
        assert_eq!(extract_mentions("contact me@example.com please"), Vec::<String>::new());
    }

    #[test]
    fn extracts_multiple_mentions() {
        let mentions = extract_mentions("@alpha and @beta-agent, please weigh in");
        assert_eq!(mentions, vec!["alpha", "beta-agent"]);
    }

    fn agent(name: &str) -> Agent {
        Agent::new(name, "mock", "mock")
    }

    #[test]
    fn rule1_rejects_self_reply() {
        let a = agent("helper");
        assert_eq!(
            should_agent_respond(&a, None, None, "helper", true, "hello"),
            RespondDecision::Reject
        );
    }

    #[test]
    fn rule2_rejects_other_chat() {
        let a = agent("helper");
        assert_eq!(
            should_agent_respond(&a, Some("chat-a"), Some("chat-b"), "human", false, "hi"),
            RespondDecision::Reject
        );
    }

    #[test]
    fn rule3_rejects_without_mention_when_auto_reply_off() {
        let mut a = agent("helper");
        a.auto_reply = false;
        assert_eq!(
            should_agent_respond(&a, None, None, "human", false, "hi everyone"),
            RespondDecision::Reject
        );
        assert_eq!(
            should_agent_respond(&a, None, None, "human", false, "@helper hi"),
            RespondDecision::Accept
        );
    }

    #[test]
    fn rule4_mentions_someone_else_is_memory_only() {
        let a = agent("helper");
        assert_eq!(
            should_agent_respond(&a, None, None, "human", false, "@other do this"),
            RespondDecision::MemoryOnly
        );
    }

    #[test]
    fn rule5_agent_broadcast_absorbed_as_memory_only() {
        let a = agent("helper");
        assert_eq!(
            should_agent_respond(&a, None, None, "other-agent", true, "status update"),
            RespondDecision::MemoryOnly
        );
    }

    #[test]
    fn rule6_turn_limit_reached() {
        let mut a = agent("helper").with_llm_call_limit(1);
        a.llm_call_count = 1;
        assert_eq!(
            should_agent_respond(&a, None, None, "human", false, "hi"),
            RespondDecision::TurnLimitReached
        );
    }

    #[test]
    fn rule7_accepts_plain_human_message() {
        let a = agent("helper");
        assert_eq!(
            should_agent_respond(&a, None, None, "human", false, "hi"),
            RespondDecision::Accept
        );
    }
}
