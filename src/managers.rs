//! World/Agent/Chat managers.
//!
//! CRUD over many worlds, each backed by its own [`Orchestrator`].
//! `WorldManager` owns the active-world registry; agent and chat CRUD are
//! free functions that take the world they operate on rather than being
//! wrapped in another manager type.

use crate::config::AgentWorldConfig;
use crate::error::{AgentWorldError, Result};
use crate::model::{slugify, Agent, Chat};
use crate::orchestrator::Orchestrator;
use crate::provider::LlmProvider;
use crate::store::{EventFilter, EventStore};
use crate::tools::skill::{self, SkillSource};
use crate::world::{World, WorldConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// On-disk/in-memory snapshot of a world's durable configuration. Event
/// history lives in the
/// `EventStore`; this only carries what's needed to reconstruct the `World`
/// shell and its registered agents/chats on `loadWorld`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorldRecord {
    config: WorldConfig,
    current_chat_id: Option<String>,
    agents: Vec<Agent>,
    chats: Vec<Chat>,
}

/// Durable storage for world metadata, selected the same way as
/// [`crate::store::EventStore`] via `AgentWorldConfig::storage_type`.
trait WorldStore: Send + Sync {
    fn save(&self, record: &WorldRecord) -> Result<()>;
    fn load(&self, world_id: &str) -> Result<Option<WorldRecord>>;
    fn delete(&self, world_id: &str) -> Result<()>;
    fn list_ids(&self) -> Result<Vec<String>>;
}

#[derive(Default)]
struct MemoryWorldStore {
    records: Mutex<HashMap<String, WorldRecord>>,
}

impl WorldStore for MemoryWorldStore {
    fn save(&self, record: &WorldRecord) -> Result<()> {
        self.records
            .lock()
            .expect("world store poisoned")
            .insert(record.config.id.clone(), record.clone());
        Ok(())
    }

    fn load(&self, world_id: &str) -> Result<Option<WorldRecord>> {
        Ok(self.records.lock().expect("world store poisoned").get(world_id).cloned())
    }

    fn delete(&self, world_id: &str) -> Result<()> {
        self.records.lock().expect("world store poisoned").remove(world_id);
        Ok(())
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self.records.lock().expect("world store poisoned").keys().cloned().collect())
    }
}

struct FileWorldStore {
    root: PathBuf,
}

impl FileWorldStore {
    fn path_for(&self, world_id: &str) -> PathBuf {
        self.root.join(format!("{}.world.json", world_id))
    }
}

impl WorldStore for FileWorldStore {
    fn save(&self, record: &WorldRecord) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| AgentWorldError::Storage(e.to_string()))?;
        let json = serde_json::to_vec_pretty(record)?;
        fs::write(self.path_for(&record.config.id), json).map_err(|e| AgentWorldError::Storage(e.to_string()))
    }

    fn load(&self, world_id: &str) -> Result<Option<WorldRecord>> {
        let path = self.path_for(world_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path).map_err(|e| AgentWorldError::Storage(e.to_string()))?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    fn delete(&self, world_id: &str) -> Result<()> {
        let path = self.path_for(world_id);
        if path.exists() {
            fs::remove_file(path).map_err(|e| AgentWorldError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Ok(Vec::new());
        };
        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if let Some(id) = name.strip_suffix(".world.json") {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }
}

fn world_store_for(config: &AgentWorldConfig) -> Box<dyn WorldStore> {
    match config.storage_type {
        crate::config::StorageType::Memory => Box::new(MemoryWorldStore::default()),
        crate::config::StorageType::File => Box::new(FileWorldStore {
            root: config.storage_root.clone(),
        }),
    }
}

/// Discovers skills from global and project-scoped directories and loads
/// them into `registry`, honoring the enable toggles and disable lists of
/// Called once per world at `createWorld`/`loadWorld`
/// time, matching the "singleton that auto-syncs on process start" note of
/// (one registry per world here, since each world has
/// its own working directory and therefore its own project scope).
pub fn sync_skill_registry(
    config: &AgentWorldConfig,
    project_skill_dirs: &[PathBuf],
    registry: &mut skill::SkillRegistry,
) {
    registry.discover(
        &skill::default_global_skill_dirs(),
        SkillSource::Global,
        config.enable_global_skills,
        &config.disabled_global_skills,
    );
    registry.discover(
        project_skill_dirs,
        SkillSource::Project,
        config.enable_project_skills,
        &config.disabled_project_skills,
    );
}

/// CRUD over world storage plus the active-world registry. `loadWorld`
/// both rehydrates a world from storage and registers it
/// as "the" active runtime for its id; `getActiveSubscribedWorld` only ever
/// looks in that registry, never touching storage, so edit-resubmission
/// paths reuse whatever runtime already has subscribers.
pub struct WorldManager<S: EventStore> {
    store: Arc<S>,
    world_store: Box<dyn WorldStore>,
    config: AgentWorldConfig,
    providers: Vec<Arc<dyn LlmProvider>>,
    active: Mutex<HashMap<String, Arc<Orchestrator<S>>>>,
}

impl<S: EventStore + Send + Sync + 'static> WorldManager<S> {
    pub fn new(store: Arc<S>, config: AgentWorldConfig, providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self {
            world_store: world_store_for(&config),
            store,
            config,
            providers,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn build_orchestrator(&self, record: WorldRecord) -> Arc<Orchestrator<S>> {
        let world = World::new(record.config);
        *world.current_chat_id.lock().expect("current chat poisoned") = record.current_chat_id;
        for agent in record.agents {
            world.add_agent(agent);
        }
        {
            let mut chats = world.chats.lock().expect("world chats poisoned");
            for chat in record.chats {
                chats.insert(chat.id.clone(), chat);
            }
        }
        let mut orchestrator = Orchestrator::new(world, Arc::clone(&self.store), self.config.clone());
        for provider in &self.providers {
            orchestrator.register_provider(Arc::clone(provider));
        }
        Arc::new(orchestrator)
    }

    fn snapshot(&self, orchestrator: &Orchestrator<S>) -> WorldRecord {
        WorldRecord {
            config: orchestrator.world.config.lock().expect("world config poisoned").clone(),
            current_chat_id: orchestrator.world.current_chat_id.lock().expect("current chat poisoned").clone(),
            agents: orchestrator.world.agents.lock().expect("world agents poisoned").values().cloned().collect(),
            chats: orchestrator.world.chats.lock().expect("world chats poisoned").values().cloned().collect(),
        }
    }

    /// Creates a brand-new world, persists it, registers it as active, and
    /// syncs its skill registry from `project_skill_dirs`.
    pub async fn create_world(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        project_skill_dirs: &[PathBuf],
    ) -> Result<Arc<Orchestrator<S>>> {
        let id = id.into();
        if self.world_store.load(&id)?.is_some() {
            return Err(AgentWorldError::Conflict(format!("world '{}' already exists", id)));
        }
        let record = WorldRecord {
            config: WorldConfig::new(id.clone(), name.into()),
            current_chat_id: None,
            agents: Vec::new(),
            chats: Vec::new(),
        };
        self.world_store.save(&record)?;
        let orchestrator = self.build_orchestrator(record);
        {
            let mut tools = orchestrator.tools.lock().await;
            sync_skill_registry(&self.config, project_skill_dirs, &mut tools.skills);
            tools.refresh_mcp_index().await;
        }
        self.active.lock().expect("active world registry poisoned").insert(id, Arc::clone(&orchestrator));
        Ok(orchestrator)
    }

    /// Loads a world from storage and registers it as the active runtime for
    /// its id. Returns the already-active instance if
    /// one is registered rather than rehydrating a second copy.
    pub async fn load_world(&self, id: &str, project_skill_dirs: &[PathBuf]) -> Result<Arc<Orchestrator<S>>> {
        if let Some(existing) = self.get_active_subscribed_world(id) {
            return Ok(existing);
        }
        let record = self
            .world_store
            .load(id)?
            .ok_or_else(|| AgentWorldError::NotFound(format!("world '{}'", id)))?;
        let orchestrator = self.build_orchestrator(record);
        {
            let mut tools = orchestrator.tools.lock().await;
            sync_skill_registry(&self.config, project_skill_dirs, &mut tools.skills);
            tools.refresh_mcp_index().await;
        }
        self.active
            .lock()
            .expect("active world registry poisoned")
            .insert(id.to_string(), Arc::clone(&orchestrator));
        Ok(orchestrator)
    }

    /// Looks up an already-loaded runtime without touching storage. Used by
    /// edit-resubmission paths that must emit on the
    /// runtime subscribers are actually attached to.
    pub fn get_active_subscribed_world(&self, id: &str) -> Option<Arc<Orchestrator<S>>> {
        self.active.lock().expect("active world registry poisoned").get(id).cloned()
    }

    pub fn update_world(&self, id: &str, update: impl FnOnce(&mut WorldConfig)) -> Result<()> {
        let orchestrator = self
            .get_active_subscribed_world(id)
            .ok_or_else(|| AgentWorldError::NotFound(format!("world '{}'", id)))?;
        {
            let mut config = orchestrator.world.config.lock().expect("world config poisoned");
            update(&mut config);
        }
        let record = self.snapshot(&orchestrator);
        self.world_store.save(&record)
    }

    /// Unregisters and drops the active runtime (if any) and removes its
    /// storage record. Dropping the `Arc<World>` cancels any HITLs that were
    /// only reachable through it; there is no separate
    /// subscriber-notification step since this crate has no network layer.
    pub fn delete_world(&self, id: &str) -> Result<()> {
        self.active.lock().expect("active world registry poisoned").remove(id);
        self.world_store.delete(id)
    }

    pub fn list_world_ids(&self) -> Result<Vec<String>> {
        self.world_store.list_ids()
    }

    /// Persists the current in-memory agent/chat state of an active world,
    /// used after agent/chat CRUD mutations below so storage doesn't drift
    /// from the runtime.
    pub fn persist(&self, orchestrator: &Orchestrator<S>) -> Result<()> {
        let record = self.snapshot(orchestrator);
        self.world_store.save(&record)
    }
}

/// Adds `agent` to `world`, enforcing uniqueness by slugified id. Returns
/// the assigned id.
pub fn create_agent(world: &World, agent: Agent) -> Result<String> {
    let mut agents = world.agents.lock().expect("world agents poisoned");
    if agents.contains_key(&agent.id) {
        return Err(AgentWorldError::Conflict(format!("agent '{}' already exists", agent.id)));
    }
    let id = agent.id.clone();
    agents.insert(id.clone(), agent);
    Ok(id)
}

/// Mutates an existing agent in place. `update` only touches the fields it
/// assigns; everything else is preserved ( "update
/// preserves fields unless explicitly changed").
pub fn update_agent(world: &World, agent_id: &str, update: impl FnOnce(&mut Agent)) -> Result<()> {
    let mut agents = world.agents.lock().expect("world agents poisoned");
    let agent = agents
        .get_mut(agent_id)
        .ok_or_else(|| AgentWorldError::NotFound(format!("agent '{}'", agent_id)))?;
    update(agent);
    Ok(())
}

pub fn delete_agent(world: &World, agent_id: &str) -> Result<Agent> {
    world
        .remove_agent(agent_id)
        .ok_or_else(|| AgentWorldError::NotFound(format!("agent '{}'", agent_id)))
}

/// Creates a chat, making it current if `world` has no current chat yet.
pub fn create_chat(world: &World, id: impl Into<String>, name: impl Into<String>) -> Result<Chat> {
    let chat = Chat::new(id, name);
    let mut chats = world.chats.lock().expect("world chats poisoned");
    if chats.contains_key(&chat.id) {
        return Err(AgentWorldError::Conflict(format!("chat '{}' already exists", chat.id)));
    }
    chats.insert(chat.id.clone(), chat.clone());
    drop(chats);
    let mut current = world.current_chat_id.lock().expect("current chat poisoned");
    if current.is_none() {
        *current = Some(chat.id.clone());
    }
    Ok(chat)
}

pub fn update_chat(world: &World, chat_id: &str, update: impl FnOnce(&mut Chat)) -> Result<()> {
    let mut chats = world.chats.lock().expect("world chats poisoned");
    let chat = chats
        .get_mut(chat_id)
        .ok_or_else(|| AgentWorldError::NotFound(format!("chat '{}'", chat_id)))?;
    update(chat);
    chat.updated_at = chrono::Utc::now();
    Ok(())
}

/// Deletes a chat, clearing `currentChatId` if it pointed at the deleted
/// chat.
pub fn delete_chat(world: &World, chat_id: &str) -> Result<Chat> {
    let removed = {
        let mut chats = world.chats.lock().expect("world chats poisoned");
        chats
            .remove(chat_id)
            .ok_or_else(|| AgentWorldError::NotFound(format!("chat '{}'", chat_id)))?
    };
    let mut current = world.current_chat_id.lock().expect("current chat poisoned");
    if current.as_deref() == Some(chat_id) {
        *current = None;
    }
    Ok(removed)
}

/// Branches a new chat from `source_chat_id` at `message_id` (inclusive),
/// both in the event store and in the in-memory chat registry.
pub fn branch_chat<S: EventStore>(
    world: &World,
    store: &S,
    source_chat_id: &str,
    message_id: &str,
    new_chat_id: impl Into<String>,
    new_chat_name: impl Into<String>,
) -> Result<Chat> {
    let new_chat_id = new_chat_id.into();
    store.branch_chat_from_message(&world.id(), source_chat_id, message_id, &new_chat_id)?;
    let new_chat = Chat::new(new_chat_id, new_chat_name);
    world
        .chats
        .lock()
        .expect("world chats poisoned")
        .insert(new_chat.id.clone(), new_chat.clone());
    Ok(new_chat)
}

/// Outcome of [`edit_user_message`]: a structured
/// `{success, failedAgents[]}` result.
#[derive(Debug, Clone, Default)]
pub struct EditMessageOutcome {
    pub success: bool,
    pub failed_agents: Vec<String>,
}

/// `editUserMessage(worldId, chatId, messageId, newText)`: deletes
/// `messageId` forward, drops the truncated rows from every
/// agent's in-memory history, then resubmits `new_text` as a fresh incoming
/// message from whoever sent the original. Does not gate on current-chat;
/// callers pick which runtime to resubmit through by choosing which
/// `orchestrator` they pass in (the active subscribed world if one exists,
/// otherwise a freshly loaded one)'s note on
/// `getActiveSubscribedWorld`.
pub async fn edit_user_message<S: EventStore + Send + Sync + 'static>(
    orchestrator: &Arc<Orchestrator<S>>,
    chat_id: &str,
    message_id: &str,
    new_text: impl Into<String>,
) -> Result<EditMessageOutcome> {
    let world_id = orchestrator.world.id();
    let existing = orchestrator
        .store
        .get_events(&world_id, &EventFilter::default())?
        .into_iter()
        .find(|e| e.chat_id.as_deref() == Some(chat_id) && e.message_id.as_deref() == Some(message_id));
    let Some(original) = existing else {
        return Err(AgentWorldError::NotFound(format!("message '{}'", message_id)));
    };
    let sender = original.sender.clone().unwrap_or_default();

    let outcome = orchestrator.store.remove_messages_from(&world_id, Some(chat_id), message_id)?;

    {
        let mut agents = orchestrator.world.agents.lock().expect("world agents poisoned");
        for agent in agents.values_mut() {
            agent.memory.retain(|e| {
                !(e.chat_id.as_deref() == Some(chat_id)
                    && e.seq >= original.seq)
            });
        }
    }

    orchestrator
        .process_incoming_message(new_text.into(), sender, false, Some(chat_id.to_string()))
        .await?;

    Ok(EditMessageOutcome {
        success: true,
        failed_agents: outcome.failed_agents,
    })
}
