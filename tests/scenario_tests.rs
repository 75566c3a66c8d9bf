//! End-to-end scenario tests: S1 mention routing, S2
//! turn limit, S6 edit & resubmit, S7 branch. S3/S4/S5 are covered as unit
//! tests closer to the code they exercise (`tools::approval`, `memory`).

use agent_world::config::AgentWorldConfig;
use agent_world::managers::{branch_chat, create_chat, edit_user_message};
use agent_world::model::{Agent, EventKind, MessageMetadata, Role, StoredEvent};
use agent_world::orchestrator::Orchestrator;
use agent_world::provider::LlmProvider;
use agent_world::providers::mock::ScriptedProvider;
use agent_world::store::{EventFilter, EventStore, MemoryEventStore};
use agent_world::world::{World, WorldConfig};
use std::sync::Arc;
use std::time::Duration;

fn mock_provider() -> Arc<dyn LlmProvider> {
    Arc::new(ScriptedProvider::new("mock", vec![]))
}

async fn settle() {
    // lets any `tokio::spawn`ed follow-up turns run before assertions.
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn make_orchestrator(world: Arc<World>) -> Arc<Orchestrator<MemoryEventStore>> {
    let mut orchestrator = Orchestrator::new(world, Arc::new(MemoryEventStore::new()), AgentWorldConfig::default());
    orchestrator.register_provider(mock_provider());
    Arc::new(orchestrator)
}

#[tokio::test]
async fn s1_broadcast_then_mention_routing() {
    let world = World::new(WorldConfig::new("w1", "Test World"));
    world.add_agent(Agent::new("a1", "mock", "mock"));
    world.add_agent(Agent::new("a2", "mock", "mock"));
    world.add_agent(Agent::new("a3", "mock", "mock"));
    let orchestrator = make_orchestrator(world);

    orchestrator.process_incoming_message("hi", "human", false, None).await.unwrap();
    settle().await;
    {
        let agents = orchestrator.world.agents.lock().unwrap();
        assert_eq!(agents.get("a1").unwrap().llm_call_count, 1);
        assert_eq!(agents.get("a2").unwrap().llm_call_count, 1);
        assert_eq!(agents.get("a3").unwrap().llm_call_count, 1);
    }

    orchestrator.process_incoming_message("@a1 hi", "human", false, None).await.unwrap();
    settle().await;
    {
        let agents = orchestrator.world.agents.lock().unwrap();
        assert_eq!(agents.get("a1").unwrap().llm_call_count, 2);
        // a2/a3 only absorbed the mention-only message into memory, no reply.
        assert_eq!(agents.get("a2").unwrap().llm_call_count, 1);
        assert_eq!(agents.get("a3").unwrap().llm_call_count, 1);
        assert!(agents.get("a2").unwrap().memory.iter().any(|e| e.content.as_deref() == Some("@a1 hi")));
    }
}

#[tokio::test]
async fn s2_turn_limit_blocks_second_reply() {
    let world = World::new(WorldConfig::new("w1", "Test World"));
    world.add_agent(Agent::new("a1", "mock", "mock").with_llm_call_limit(1));
    let orchestrator = make_orchestrator(world);

    orchestrator.process_incoming_message("@a1 x", "human", false, None).await.unwrap();
    settle().await;
    assert_eq!(orchestrator.world.agents.lock().unwrap().get("a1").unwrap().llm_call_count, 1);

    orchestrator.process_incoming_message("@a1 x", "human", false, None).await.unwrap();
    settle().await;
    // still 1: the turn-limited agent records the message but never calls the provider again.
    assert_eq!(orchestrator.world.agents.lock().unwrap().get("a1").unwrap().llm_call_count, 1);
}

fn user_event(chat_id: &str, message_id: &str, seq: u64, content: &str) -> StoredEvent {
    StoredEvent {
        id: format!("evt-{}", message_id),
        world_id: "w1".to_string(),
        chat_id: Some(chat_id.to_string()),
        kind: EventKind::Message,
        seq,
        created_at: chrono::Utc::now(),
        message_id: Some(message_id.to_string()),
        sender: Some("human".to_string()),
        role: Some(Role::User),
        content: Some(content.to_string()),
        reply_to_message_id: None,
        tool_calls: None,
        tool_call_id: None,
        metadata: Some(MessageMetadata {
            owner_agent_ids: vec!["a1".to_string()],
            recipient_agent_id: None,
            direction: agent_world::model::Direction::HumanToAgent,
            is_memory_only: false,
            is_cross_agent: false,
            thread_root_id: message_id.to_string(),
            thread_depth: 0,
            has_tool_calls: false,
        }),
    }
}

#[tokio::test]
async fn s6_edit_and_resubmit() {
    let world = World::new(WorldConfig::new("w1", "Test World"));
    world.add_agent(Agent::new("a1", "mock", "mock"));
    create_chat(&world, "cK", "General").unwrap();

    let store = Arc::new(MemoryEventStore::new());
    let mut orchestrator = Orchestrator::new(Arc::clone(&world), Arc::clone(&store), AgentWorldConfig::default());
    orchestrator.register_provider(mock_provider());
    let orchestrator = Arc::new(orchestrator);

    store.save_event(user_event("cK", "m42", 0, "original text")).unwrap();
    store.save_event(user_event("cK", "m43", 1, "a later row")).unwrap();
    {
        let mut agents = world.agents.lock().unwrap();
        let memory = &mut agents.get_mut("a1").unwrap().memory;
        memory.push(user_event("cK", "m42", 0, "original text"));
        memory.push(user_event("cK", "m43", 1, "a later row"));
    }

    let outcome = edit_user_message(&orchestrator, "cK", "m42", "new text").await.unwrap();
    assert!(outcome.success);

    let remaining = store.get_events("w1", &EventFilter { chat_id: Some("cK".to_string()), ..Default::default() }).unwrap();
    assert!(!remaining.iter().any(|e| e.message_id.as_deref() == Some("m42")));
    assert!(!remaining.iter().any(|e| e.message_id.as_deref() == Some("m43")));
    assert!(remaining.iter().any(|e| e.content.as_deref() == Some("new text")));

    settle().await;
    let agents = world.agents.lock().unwrap();
    let memory = &agents.get("a1").unwrap().memory;
    assert!(!memory.iter().any(|e| e.content.as_deref() == Some("original text")));
    assert!(!memory.iter().any(|e| e.content.as_deref() == Some("a later row")));
}

#[tokio::test]
async fn s7_branch_then_delete_leaves_source_untouched() {
    let world = World::new(WorldConfig::new("w1", "Test World"));
    create_chat(&world, "cK", "General").unwrap();
    let store = MemoryEventStore::new();
    store.save_event(user_event("cK", "m1", 0, "first")).unwrap();
    store.save_event(user_event("cK", "m42", 1, "second")).unwrap();
    store.save_event(user_event("cK", "m43", 2, "third")).unwrap();

    let branched = branch_chat(&world, &store, "cK", "m42", "cK2", "Branch").unwrap();
    assert_eq!(branched.id, "cK2");

    let branch_events = store
        .get_events("w1", &EventFilter { chat_id: Some("cK2".to_string()), ..Default::default() })
        .unwrap();
    assert_eq!(branch_events.len(), 2);

    agent_world::managers::delete_chat(&world, "cK2").unwrap();
    let source_events = store
        .get_events("w1", &EventFilter { chat_id: Some("cK".to_string()), ..Default::default() })
        .unwrap();
    assert_eq!(source_events.len(), 3);
    assert!(world.chats.lock().unwrap().contains_key("cK"));
    assert!(!world.chats.lock().unwrap().contains_key("cK2"));
}
