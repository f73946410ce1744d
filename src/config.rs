//! Configuration for the orchestration core
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration. Durations are expressed in seconds or milliseconds so the
//! file format stays flat.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::skills::SkillProfile;
use crate::tools::mcp::McpServerConfig;

/// Which turn driver runs the round loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorMode {
    #[default]
    Legacy,
    Graph,
}

impl OrchestratorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Graph => "graph",
        }
    }
}

impl std::str::FromStr for OrchestratorMode {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "graph" | "langgraph" => Ok(Self::Graph),
            other => Err(OrchestratorError::Config(format!(
                "unknown orchestrator mode `{other}`"
            ))),
        }
    }
}

/// Closed set of provider bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "deepseek")]
    DeepSeek,
    Gemini,
    /// Any other endpoint speaking the OpenAI chat-completions protocol.
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
}

impl ProviderKind {
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("https://api.openai.com/v1"),
            Self::DeepSeek => Some("https://api.deepseek.com/v1"),
            Self::Gemini => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
            Self::OpenAiCompatible => None,
        }
    }
}

/// Connection settings for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Inline API key; takes precedence over `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    pub default_model: String,
    /// Models advertised in the capability matrix.
    #[serde(default)]
    pub models: Vec<String>,
    /// Per-call timeout override for this provider.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ProviderSettings {
    fn preset(kind: ProviderKind, key_env: &str, model: &str, models: &[&str]) -> Self {
        Self {
            kind,
            base_url: None,
            api_key_env: Some(key_env.to_string()),
            api_key: None,
            default_model: model.to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            timeout_secs: None,
        }
    }

    pub fn base_url(&self) -> Option<String> {
        self.base_url
            .clone()
            .or_else(|| self.kind.default_base_url().map(str::to_string))
    }

    /// Resolve the API key from the inline value or the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        self.api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// Default provider/model for one deployment environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentDefaults {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub enabled: bool,
    /// Fallbacks keyed by `provider/model` or by bare provider name. Entries
    /// are `provider/model` or a bare provider (meaning its default model).
    pub chains: BTreeMap<String, Vec<String>>,
    /// Fallbacks used when no chain matches the primary.
    pub default_chain: Vec<String>,
    /// Attempts per candidate before advancing, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f32,
    pub max_backoff_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chains: BTreeMap::new(),
            default_chain: Vec::new(),
            max_attempts: 2,
            initial_backoff_ms: 200,
            backoff_factor: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

/// One rolling window limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRule {
    pub window_secs: u64,
    #[serde(default)]
    pub max_requests: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

impl QuotaRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub enabled: bool,
    pub default_class: String,
    pub classes: BTreeMap<String, Vec<QuotaRule>>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let mut classes = BTreeMap::new();
        classes.insert(
            "default".to_string(),
            vec![
                QuotaRule {
                    window_secs: 60,
                    max_requests: Some(60),
                    max_tokens: None,
                },
                QuotaRule {
                    window_secs: 86_400,
                    max_requests: Some(2_000),
                    max_tokens: Some(2_000_000),
                },
            ],
        );
        Self {
            enabled: true,
            default_class: "default".to_string(),
            classes,
        }
    }
}

/// What a second turn on a busy conversation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    Reject,
    #[default]
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub max_rounds: u32,
    pub max_wall_clock_secs: u64,
    pub provider_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    /// Per-tool timeout overrides in seconds.
    pub tool_timeouts: BTreeMap<String, u64>,
    pub tool_concurrency: usize,
    pub max_history_messages: usize,
    pub default_temperature: Option<f32>,
    pub busy_policy: BusyPolicy,
    pub busy_wait_secs: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_rounds: 4,
            max_wall_clock_secs: 120,
            provider_timeout_secs: 60,
            tool_timeout_secs: 15,
            tool_timeouts: BTreeMap::new(),
            tool_concurrency: 4,
            max_history_messages: 20,
            default_temperature: Some(0.7),
            busy_policy: BusyPolicy::Queue,
            busy_wait_secs: 30,
        }
    }
}

impl TurnConfig {
    pub fn wall_clock_budget(&self) -> Duration {
        Duration::from_secs(self.max_wall_clock_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn busy_wait(&self) -> Duration {
        Duration::from_secs(self.busy_wait_secs)
    }
}

/// Rolling summary of older conversation messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    /// Unsummarized messages older than the recent window needed before a refresh.
    pub trigger_messages: usize,
    /// Most recent messages always kept verbatim.
    pub keep_recent_messages: usize,
    pub summary_max_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_messages: 12,
            keep_recent_messages: 8,
            summary_max_chars: 2_000,
        }
    }
}

impl MemoryConfig {
    pub fn trigger(&self) -> usize {
        self.trigger_messages.max(6)
    }

    pub fn keep_recent(&self) -> usize {
        self.keep_recent_messages.clamp(4, 100)
    }

    pub fn max_chars(&self) -> usize {
        self.summary_max_chars.max(500)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Number of request records kept for the recent/summary read models.
    pub metrics_capacity: usize,
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_capacity: 1_000,
            log_filter: "info,tower_turns=debug".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub mode: OrchestratorMode,
    /// Selects an entry of `environments`.
    pub environment: String,
    pub default_provider: String,
    pub default_model: Option<String>,
    pub environments: BTreeMap<String, EnvironmentDefaults>,
    pub providers: BTreeMap<String, ProviderSettings>,
    pub failover: FailoverConfig,
    pub quota: QuotaConfig,
    pub turn: TurnConfig,
    pub memory: MemoryConfig,
    pub observability: ObservabilityConfig,
    pub mcp_servers: Vec<McpServerConfig>,
    /// Extra skills on top of the built-in catalog.
    pub skills: Vec<SkillProfile>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            "openai".to_string(),
            ProviderSettings::preset(
                ProviderKind::OpenAi,
                "OPENAI_API_KEY",
                "gpt-4o-mini",
                &["gpt-4o-mini", "gpt-4o"],
            ),
        );
        providers.insert(
            "deepseek".to_string(),
            ProviderSettings::preset(
                ProviderKind::DeepSeek,
                "DEEPSEEK_API_KEY",
                "deepseek-chat",
                &["deepseek-chat", "deepseek-reasoner"],
            ),
        );
        providers.insert(
            "gemini".to_string(),
            ProviderSettings::preset(
                ProviderKind::Gemini,
                "GEMINI_API_KEY",
                "gemini-2.0-flash",
                &["gemini-2.0-flash"],
            ),
        );
        Self {
            mode: OrchestratorMode::Legacy,
            environment: "development".to_string(),
            default_provider: "openai".to_string(),
            default_model: None,
            environments: BTreeMap::new(),
            providers,
            failover: FailoverConfig::default(),
            quota: QuotaConfig::default(),
            turn: TurnConfig::default(),
            memory: MemoryConfig::default(),
            observability: ObservabilityConfig::default(),
            mcp_servers: Vec::new(),
            skills: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| OrchestratorError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay `TURNS_*` environment variables onto this configuration.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(env) = std::env::var("TURNS_ENV") {
            self.environment = env;
        }
        if let Ok(mode) = std::env::var("TURNS_ORCHESTRATOR_MODE") {
            self.mode = mode.parse()?;
        }
        if let Ok(provider) = std::env::var("TURNS_DEFAULT_PROVIDER") {
            self.default_provider = provider;
        }
        if let Ok(model) = std::env::var("TURNS_DEFAULT_MODEL") {
            self.default_model = Some(model);
        }
        if let Ok(rounds) = std::env::var("TURNS_MAX_ROUNDS") {
            self.turn.max_rounds = rounds
                .parse()
                .map_err(|_| OrchestratorError::Config(format!("TURNS_MAX_ROUNDS={rounds}")))?;
        }
        if let Ok(filter) = std::env::var("TURNS_LOG") {
            self.observability.log_filter = filter;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.turn.max_rounds == 0 {
            return Err(OrchestratorError::Config(
                "turn.max_rounds must be at least 1".into(),
            ));
        }
        if self.turn.tool_concurrency == 0 {
            return Err(OrchestratorError::Config(
                "turn.tool_concurrency must be at least 1".into(),
            ));
        }
        if self.failover.max_attempts == 0 {
            return Err(OrchestratorError::Config(
                "failover.max_attempts must be at least 1".into(),
            ));
        }
        let (provider, _) = self.resolved_default();
        if !self.providers.contains_key(&provider) {
            return Err(OrchestratorError::Config(format!(
                "default provider `{provider}` has no [providers.{provider}] section"
            )));
        }
        Ok(())
    }

    /// Default provider and model for the active environment.
    pub fn resolved_default(&self) -> (String, String) {
        let (provider, model) = match self.environments.get(&self.environment) {
            Some(env) => (env.provider.clone(), env.model.clone()),
            None => (self.default_provider.clone(), self.default_model.clone()),
        };
        let model = model.unwrap_or_else(|| self.default_model_for(&provider));
        (provider, model)
    }

    /// Default model of `provider`, or an empty string when it is unknown.
    pub fn default_model_for(&self, provider: &str) -> String {
        self.providers
            .get(provider)
            .map(|p| p.default_model.clone())
            .unwrap_or_default()
    }

    /// Timeout for one provider call.
    pub fn provider_timeout(&self, provider: &str) -> Duration {
        self.providers
            .get(provider)
            .and_then(|p| p.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.turn.provider_timeout())
    }
}

/// Builder for programmatic configuration.
pub struct ConfigBuilder {
    config: OrchestratorConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
        }
    }

    pub fn mode(mut self, mode: OrchestratorMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn default_provider(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.config.default_provider = provider.into();
        self.config.default_model = Some(model.into());
        self
    }

    pub fn provider(mut self, name: impl Into<String>, settings: ProviderSettings) -> Self {
        self.config.providers.insert(name.into(), settings);
        self
    }

    pub fn fallback_chain(mut self, primary: impl Into<String>, fallbacks: Vec<String>) -> Self {
        self.config.failover.chains.insert(primary.into(), fallbacks);
        self
    }

    pub fn failover_enabled(mut self, enabled: bool) -> Self {
        self.config.failover.enabled = enabled;
        self
    }

    pub fn retry(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.config.failover.max_attempts = max_attempts;
        self.config.failover.initial_backoff_ms = initial_backoff.as_millis() as u64;
        self
    }

    pub fn quota_enabled(mut self, enabled: bool) -> Self {
        self.config.quota.enabled = enabled;
        self
    }

    pub fn quota_class(mut self, class: impl Into<String>, rules: Vec<QuotaRule>) -> Self {
        self.config.quota.classes.insert(class.into(), rules);
        self
    }

    pub fn max_rounds(mut self, rounds: u32) -> Self {
        self.config.turn.max_rounds = rounds;
        self
    }

    pub fn wall_clock_budget(mut self, budget: Duration) -> Self {
        self.config.turn.max_wall_clock_secs = budget.as_secs().max(1);
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.config.turn.tool_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn tool_concurrency(mut self, limit: usize) -> Self {
        self.config.turn.tool_concurrency = limit;
        self
    }

    pub fn busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.config.turn.busy_policy = policy;
        self
    }

    pub fn mcp_server(mut self, server: McpServerConfig) -> Self {
        self.config.mcp_servers.push(server);
        self
    }

    pub fn memory(mut self, memory: MemoryConfig) -> Self {
        self.config.memory = memory;
        self
    }

    pub fn build(self) -> OrchestratorConfig {
        self.config
    }
}
