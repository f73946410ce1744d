//! Capability matrix: what this deployment can do, recomputed on every read.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::{OrchestratorConfig, OrchestratorMode};
use crate::provider::ProviderRegistry;
use crate::skills::SkillCatalog;
use crate::tools::{ToolRegistry, ToolSource};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderCapability {
    pub name: String,
    pub default_model: String,
    pub models: Vec<String>,
    /// Whether an API key is available; scripted providers always count as configured.
    pub configured: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityMatrix {
    pub orchestrator_mode: OrchestratorMode,
    pub multi_turn: bool,
    pub function_calling: bool,
    pub sse_streaming: bool,
    pub mcp: bool,
    pub rag: bool,
    pub skill: bool,
    pub human_approval: bool,
    pub resumable_execution: bool,
    pub providers: Vec<ProviderCapability>,
    pub tools: Vec<String>,
    pub skills: Vec<String>,
    pub details: BTreeMap<String, Value>,
}

impl CapabilityMatrix {
    pub fn compute(
        config: &OrchestratorConfig,
        providers: &ProviderRegistry,
        tools: &ToolRegistry,
        skills: &SkillCatalog,
        has_retriever: bool,
    ) -> Self {
        let descriptors = tools.list();
        let mcp = descriptors
            .iter()
            .any(|d| matches!(d.source, ToolSource::Mcp { .. }));
        let providers = providers
            .names()
            .into_iter()
            .map(|name| match config.providers.get(&name) {
                Some(settings) => ProviderCapability {
                    default_model: settings.default_model.clone(),
                    models: settings.models.clone(),
                    configured: settings.resolve_api_key().is_some(),
                    name,
                },
                None => ProviderCapability {
                    name,
                    default_model: String::new(),
                    models: Vec::new(),
                    configured: true,
                },
            })
            .collect();

        let (default_provider, default_model) = config.resolved_default();
        let mut details = BTreeMap::new();
        details.insert("environment".into(), json!(config.environment));
        details.insert("default_provider".into(), json!(default_provider));
        details.insert("default_model".into(), json!(default_model));
        details.insert("max_rounds".into(), json!(config.turn.max_rounds));
        details.insert(
            "max_wall_clock_secs".into(),
            json!(config.turn.max_wall_clock_secs),
        );
        details.insert("rate_limit_quota".into(), json!(config.quota.enabled));
        details.insert("auto_fallback".into(), json!(config.failover.enabled));
        details.insert("memory_summary".into(), json!(config.memory.enabled));
        details.insert("busy_policy".into(), json!(config.turn.busy_policy));
        details.insert("observability".into(), json!(true));
        details.insert("approval_mode".into(), json!("not_enabled"));
        details.insert("checkpoint_backend".into(), json!("not_enabled"));

        Self {
            orchestrator_mode: config.mode,
            multi_turn: true,
            function_calling: !descriptors.is_empty(),
            sse_streaming: true,
            mcp,
            rag: has_retriever,
            skill: true,
            human_approval: false,
            resumable_execution: false,
            providers,
            tools: descriptors.into_iter().map(|d| d.name).collect(),
            skills: skills.names(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;
    use crate::tools::builtin::register_builtin_tools;
    use std::sync::Arc;

    #[test]
    fn reflects_configuration() {
        let config = OrchestratorConfig::default();
        let mut providers = ProviderRegistry::new();
        providers.insert(Arc::new(ScriptedProvider::new("mock")));
        let tools = ToolRegistry::default();
        register_builtin_tools(&tools).unwrap();

        let matrix =
            CapabilityMatrix::compute(&config, &providers, &tools, &SkillCatalog::new(), false);
        assert_eq!(matrix.orchestrator_mode, OrchestratorMode::Legacy);
        assert!(matrix.function_calling);
        assert!(!matrix.mcp);
        assert!(!matrix.rag);
        assert!(!matrix.human_approval);
        assert_eq!(matrix.providers[0].name, "mock");
        assert!(matrix.providers[0].configured);
        assert!(matrix.tools.contains(&"calculate".to_string()));
        assert_eq!(matrix.details["max_rounds"], json!(4));
    }
}
