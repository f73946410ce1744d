//! Skills: named bundles of system prompt, tool allow-list and retrieval switch.
//!
//! Two skills are built in (`default_assistant`, `coder`). Configuration adds
//! global skills; `upsert_for` adds skills visible to a single owner, which
//! shadow global skills of the same name for that owner.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Local tools the skill may use. Empty together with `mcp_servers` means all tools.
    #[serde(default)]
    pub tool_names: Vec<String>,
    /// Retrieve context for turns running under this skill.
    #[serde(default)]
    pub rag_enabled: bool,
    /// MCP servers whose tools the skill may use.
    #[serde(default)]
    pub mcp_servers: Vec<String>,
}

impl SkillProfile {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
        tool_names: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            system_prompt: system_prompt.into(),
            tool_names: tool_names.iter().map(|t| t.to_string()).collect(),
            rag_enabled: false,
            mcp_servers: Vec::new(),
        }
    }

    /// Whether the skill restricts the tool set at all.
    pub fn restricts_tools(&self) -> bool {
        !self.tool_names.is_empty() || !self.mcp_servers.is_empty()
    }
}

fn builtin() -> Vec<SkillProfile> {
    vec![
        SkillProfile::new(
            "default_assistant",
            "General assistant",
            "You are a professional, rigorous and concise AI assistant. Prefer actionable advice.",
            &["get_current_time", "calculate", "echo"],
        ),
        SkillProfile::new(
            "coder",
            "Backend engineering assistant",
            "You are a senior backend engineer. Runnable, maintainable code comes first.",
            &["calculate", "echo"],
        ),
    ]
}

#[derive(Debug)]
pub struct SkillCatalog {
    global: RwLock<BTreeMap<String, SkillProfile>>,
    owned: RwLock<BTreeMap<(String, String), SkillProfile>>,
}

impl Default for SkillCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl SkillCatalog {
    /// Catalog holding the built-in skills.
    pub fn new() -> Self {
        let global = builtin().into_iter().map(|s| (s.name.clone(), s)).collect();
        Self {
            global: RwLock::new(global),
            owned: RwLock::new(BTreeMap::new()),
        }
    }

    /// Built-ins plus configured skills; configured ones replace built-ins of the same name.
    pub fn with_skills(skills: impl IntoIterator<Item = SkillProfile>) -> Result<Self> {
        let catalog = Self::new();
        for skill in skills {
            catalog.register(skill)?;
        }
        Ok(catalog)
    }

    pub fn register(&self, skill: SkillProfile) -> Result<()> {
        let name = normalize(&skill.name)?;
        let mut global = self.global.write().unwrap_or_else(|e| e.into_inner());
        global.insert(name.clone(), SkillProfile { name, ..skill });
        Ok(())
    }

    pub fn upsert_for(&self, owner: &str, skill: SkillProfile) -> Result<()> {
        let name = normalize(&skill.name)?;
        let mut owned = self.owned.write().unwrap_or_else(|e| e.into_inner());
        owned.insert((owner.to_string(), name.clone()), SkillProfile { name, ..skill });
        Ok(())
    }

    /// Resolve `name` for `owner`; owner-scoped skills win.
    pub fn get(&self, owner: &str, name: &str) -> Option<SkillProfile> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let owned = self.owned.read().unwrap_or_else(|e| e.into_inner());
        if let Some(skill) = owned.get(&(owner.to_string(), name.to_string())) {
            return Some(skill.clone());
        }
        drop(owned);
        let global = self.global.read().unwrap_or_else(|e| e.into_inner());
        global.get(name).cloned()
    }

    pub fn require(&self, owner: &str, name: &str) -> Result<SkillProfile> {
        self.get(owner, name)
            .ok_or_else(|| OrchestratorError::SkillNotFound(name.to_string()))
    }

    /// Skills visible to `owner`, sorted by name.
    pub fn list(&self, owner: Option<&str>) -> Vec<SkillProfile> {
        let mut merged: BTreeMap<String, SkillProfile> = self
            .global
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(owner) = owner {
            let owned = self.owned.read().unwrap_or_else(|e| e.into_inner());
            for ((o, name), skill) in owned.iter() {
                if o == owner {
                    merged.insert(name.clone(), skill.clone());
                }
            }
        }
        merged.into_values().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.list(None).into_iter().map(|s| s.name).collect()
    }
}

fn normalize(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(OrchestratorError::Config("skill name must not be empty".into()));
    }
    Ok(name.to_string())
}
