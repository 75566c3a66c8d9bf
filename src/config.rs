//! Process-wide configuration.
//!
//! A plain struct, manually constructible, with a `from_env()` convenience
//! that reads well-known environment variables. No config-file-parsing
//! dependency is introduced; callers that want TOML/YAML bring their own
//! loader and build this struct from the result.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Where the event store persists its `.jsonl` logs, selected by
/// `AGENT_WORLD_STORAGE_TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    File,
    Memory,
}

impl StorageType {
    fn from_env_str(s: &str) -> Self {
        match s {
            "file" => StorageType::File,
            "memory" => StorageType::Memory,
            // "sqlite" is named in as a selectable backend; the physical
            // layout is explicitly out of scope for the core, so
            // it maps to the file backend here rather than pulling in a SQL crate.
            "sqlite" => StorageType::File,
            _ => StorageType::File,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentWorldConfig {
    pub storage_type: StorageType,
    pub storage_root: PathBuf,
    pub enable_global_skills: bool,
    pub enable_project_skills: bool,
    pub disabled_global_skills: Vec<String>,
    pub disabled_project_skills: Vec<String>,
    /// Default per-request SSE idle timeout.
    pub idle_timeout: Duration,
    /// Grace period after activity drops to zero before the idle waiter resolves.
    pub idle_grace_period: Duration,
    /// Approval/HITL timeout before a pending request is treated as denied.
    pub approval_timeout: Duration,
    /// `shell_cmd` subprocess timeout.
    pub shell_timeout: Duration,
    /// Process-wide streaming toggle. Stored separately as a static
    /// `AtomicBool` (see [`streaming_enabled`]) since it's a single
    /// process-wide flag rather than one scoped per config instance; this
    /// field seeds that flag at construction time.
    pub streaming: bool,
}

impl Default for AgentWorldConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::File,
            storage_root: PathBuf::from("agent_world_data"),
            enable_global_skills: true,
            enable_project_skills: true,
            disabled_global_skills: Vec::new(),
            disabled_project_skills: Vec::new(),
            idle_timeout: Duration::from_secs(30),
            idle_grace_period: Duration::from_secs(2),
            approval_timeout: Duration::from_secs(300),
            shell_timeout: Duration::from_millis(600_000),
            streaming: true,
        }
    }
}

impl AgentWorldConfig {
    /// Build a config from well-known `AGENT_WORLD_*` environment variables,
    /// falling back to [`AgentWorldConfig::default`] fields for anything
    /// unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let storage_type = std::env::var("AGENT_WORLD_STORAGE_TYPE")
            .ok()
            .map(|s| StorageType::from_env_str(&s))
            .unwrap_or(defaults.storage_type);
        let enable_global_skills = env_bool("AGENT_WORLD_ENABLE_GLOBAL_SKILLS")
            .unwrap_or(defaults.enable_global_skills);
        let enable_project_skills = env_bool("AGENT_WORLD_ENABLE_PROJECT_SKILLS")
            .unwrap_or(defaults.enable_project_skills);
        let disabled_global_skills = env_list("AGENT_WORLD_DISABLED_GLOBAL_SKILLS");
        let disabled_project_skills = env_list("AGENT_WORLD_DISABLED_PROJECT_SKILLS");
        Self {
            storage_type,
            enable_global_skills,
            enable_project_skills,
            disabled_global_skills,
            disabled_project_skills,
            ..defaults
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Process-wide streaming toggle: a single flag shared by the whole process
/// rather than one scoped per config instance. Initialized from
/// [`AgentWorldConfig::streaming`] via [`set_streaming_enabled`]; defaults to
/// `true` until explicitly set.
static STREAMING_ENABLED: AtomicBool = AtomicBool::new(true);

pub fn streaming_enabled() -> bool {
    STREAMING_ENABLED.load(Ordering::SeqCst)
}

pub fn set_streaming_enabled(enabled: bool) {
    STREAMING_ENABLED.store(enabled, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = AgentWorldConfig::default();
        assert_eq!(cfg.idle_timeout, Duration::from_secs(30));
        assert_eq!(cfg.idle_grace_period, Duration::from_secs(2));
        assert_eq!(cfg.approval_timeout, Duration::from_secs(300));
        assert_eq!(cfg.shell_timeout, Duration::from_millis(600_000));
    }

    #[test]
    fn env_list_splits_and_trims() {
        std::env::set_var("AGENT_WORLD_TEST_LIST", "a, b ,c");
        assert_eq!(env_list("AGENT_WORLD_TEST_LIST"), vec!["a", "b", "c"]);
        std::env::remove_var("AGENT_WORLD_TEST_LIST");
    }

    #[test]
    fn streaming_toggle_round_trips() {
        set_streaming_enabled(false);
        assert!(!streaming_enabled());
        set_streaming_enabled(true);
        assert!(streaming_enabled());
    }
}
