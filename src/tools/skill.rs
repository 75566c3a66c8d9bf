//! `load_skill` built-in tool and the skill registry.
//!
//! A skill is a directory containing a `SKILL.md` with YAML-ish front matter
//! (`name`, `description`) followed by free-form instruction body. The
//! registry discovers skills from global (`~/.agents/skills`,
//! `~/.codex/skills`) and project-scoped directories, with project skills
//! overriding global ones on id collision, and honors the
//! `AGENT_WORLD_ENABLE_*`/`AGENT_WORLD_DISABLED_*` toggles.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillSource {
    Global,
    Project,
}

#[derive(Debug, Clone)]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub body: String,
    pub content_hash: String,
    pub source: SkillSource,
}

#[derive(Debug)]
pub enum SkillError {
    NotFound(String),
    ReadError(String),
}

impl fmt::Display for SkillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkillError::NotFound(id) => write!(f, "skill '{}' not found", id),
            SkillError::ReadError(msg) => write!(f, "failed to read skill: {}", msg),
        }
    }
}

impl std::error::Error for SkillError {}

#[derive(Default)]
pub struct SkillRegistry {
    skills: HashMap<String, Skill>,
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parses the `---`-delimited front matter of a `SKILL.md` file, returning
/// `(name, description, body)`. Tolerant of missing front matter: falls back
/// to `dir_name` for `name` and an empty description.
fn parse_skill_md(raw: &str, fallback_name: &str) -> (String, String, String) {
    let mut name = fallback_name.to_string();
    let mut description = String::new();
    let mut body = raw;

    if let Some(rest) = raw.strip_prefix("---\n") {
        if let Some(end) = rest.find("\n---") {
            let front_matter = &rest[..end];
            body = &rest[end + 4..];
            for line in front_matter.lines() {
                if let Some((key, value)) = line.split_once(':') {
                    let key = key.trim();
                    let value = value.trim().trim_matches('"');
                    match key {
                        "name" => name = value.to_string(),
                        "description" => description = value.to_string(),
                        _ => {}
                    }
                }
            }
        }
    }
    (name, description, body.trim_start_matches('\n').to_string())
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discover skills under `dirs`, each expected to contain one
    /// subdirectory per skill holding a `SKILL.md`. Skills whose id is in
    /// `disabled` are skipped. `source == SkillSource::Project` entries
    /// override same-id `Global` entries already registered.
    pub fn discover(
        &mut self,
        dirs: &[PathBuf],
        source: SkillSource,
        enabled: bool,
        disabled: &[String],
    ) {
        if !enabled {
            return;
        }
        for dir in dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let id = match path.file_name().and_then(|n| n.to_str()) {
                    Some(n) => n.to_string(),
                    None => continue,
                };
                if disabled.iter().any(|d| d == &id) {
                    continue;
                }
                let skill_md = path.join("SKILL.md");
                let Ok(raw) = std::fs::read_to_string(&skill_md) else {
                    continue;
                };
                let (name, description, body) = parse_skill_md(&raw, &id);
                let skill = Skill {
                    id: id.clone(),
                    name,
                    description,
                    content_hash: content_hash(&raw),
                    body,
                    source,
                };
                match (self.skills.get(&id).map(|s| s.source), source) {
                    (Some(SkillSource::Project), SkillSource::Global) => {
                        // project already claimed this id; global never overrides it.
                    }
                    _ => {
                        self.skills.insert(id, skill);
                    }
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Skill> {
        self.skills.get(id)
    }

    pub fn enabled_skills(&self) -> Vec<&Skill> {
        let mut v: Vec<&Skill> = self.skills.values().collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        v
    }

    /// The `<available_skills>` block listed in the system prompt suffix.
    pub fn available_skills_block(&self) -> String {
        let mut out = String::from("<available_skills>\n");
        for skill in self.enabled_skills() {
            out.push_str(&format!("- {}: {}\n", skill.id, skill.description));
        }
        out.push_str("</available_skills>");
        out
    }
}

pub fn default_global_skill_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(home) = dirs_home() {
        dirs.push(home.join(".agents").join("skills"));
        dirs.push(home.join(".codex").join("skills"));
    }
    dirs
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Builds the `<skill_context>` envelope `load_skill` returns on success, or
/// a structured not-found/read-error result.
pub fn load_skill(registry: &SkillRegistry, skill_id: &str) -> Result<serde_json::Value, SkillError> {
    let skill = registry
        .get(skill_id)
        .ok_or_else(|| SkillError::NotFound(skill_id.to_string()))?;
    Ok(serde_json::json!({
        "skill_context": {
            "instructions": skill.body,
            "execution_directive": format!(
                "Follow the instructions for skill '{}' exactly; do not deviate from its documented steps.",
                skill.id
            ),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn parses_front_matter() {
        let raw = "---\nname: Researcher\ndescription: \"looks things up\"\n---\nDo research steps.\n";
        let (name, description, body) = parse_skill_md(raw, "researcher");
        assert_eq!(name, "Researcher");
        assert_eq!(description, "looks things up");
        assert_eq!(body.trim(), "Do research steps.");
    }

    #[test]
    fn falls_back_without_front_matter() {
        let (name, description, body) = parse_skill_md("just instructions", "fallback-id");
        assert_eq!(name, "fallback-id");
        assert_eq!(description, "");
        assert_eq!(body, "just instructions");
    }

    #[test]
    fn project_overrides_global_on_collision() {
        let dir = tempdir().unwrap();
        let global_dir = dir.path().join("global");
        let project_dir = dir.path().join("project");
        for (base, desc) in [(&global_dir, "global version"), (&project_dir, "project version")] {
            let skill_dir = base.join("researcher");
            fs::create_dir_all(&skill_dir).unwrap();
            fs::write(
                skill_dir.join("SKILL.md"),
                format!("---\nname: Researcher\ndescription: {}\n---\nbody\n", desc),
            )
            .unwrap();
        }
        let mut registry = SkillRegistry::new();
        registry.discover(&[global_dir], SkillSource::Global, true, &[]);
        registry.discover(&[project_dir], SkillSource::Project, true, &[]);
        let skill = registry.get("researcher").unwrap();
        assert_eq!(skill.description, "project version");
        assert_eq!(skill.source, SkillSource::Project);
    }

    #[test]
    fn disabled_skill_is_skipped() {
        let dir = tempdir().unwrap();
        let skill_dir = dir.path().join("danger");
        fs::create_dir_all(&skill_dir).unwrap();
        fs::write(skill_dir.join("SKILL.md"), "---\nname: Danger\n---\nbody").unwrap();
        let mut registry = SkillRegistry::new();
        registry.discover(
            &[dir.path().to_path_buf()],
            SkillSource::Global,
            true,
            &["danger".to_string()],
        );
        assert!(registry.get("danger").is_none());
    }

    #[test]
    fn load_skill_not_found() {
        let registry = SkillRegistry::new();
        let err = load_skill(&registry, "missing").unwrap_err();
        assert!(matches!(err, SkillError::NotFound(_)));
    }
}
