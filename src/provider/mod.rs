//! Model provider abstraction
//!
//! What this module provides
//! - A vendor-neutral contract for one model call, blocking (`send`) or
//!   incremental (`stream`), normalized to text, tool calls, finish reason and usage
//! - Error classification into transient and fatal kinds, consumed by failover
//!
//! Exports
//! - Models: `ModelRequest`, `ModelResponse`, `ModelDelta`, `ToolSpec`, `ProviderError`
//! - Trait: `ProviderAdapter`
//! - Registry: `ProviderRegistry` (provider name → adapter), built from config
//! - Implementations: `OpenAiCompatibleProvider` (async-openai), `ScriptedProvider` (tests)
//!
//! Implementation strategy
//! - Adapters return boxed futures and boxed delta streams so they can live
//!   behind `Arc<dyn ProviderAdapter>` and be swapped per configuration key
//! - `collect_stream` folds a delta stream into a `ModelResponse`, so callers
//!   that only need the final answer can consume either form

pub mod openai;
pub mod scripted;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;

use crate::config::OrchestratorConfig;
use crate::types::{FinishReason, Message, ToolCall, Usage};

pub use crate::config::ProviderKind;
pub use openai::OpenAiCompatibleProvider;
pub use scripted::{ScriptStep, ScriptedProvider};

/// Function tool advertised to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ModelParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Normalized request for one provider call.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub params: ModelParams,
}

/// Normalized result of one provider call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>, usage: Usage) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>, usage: Usage) -> Self {
        Self {
            content: String::new(),
            tool_calls: calls,
            finish_reason: FinishReason::ToolCalls,
            usage,
        }
    }

    /// Whether the model asked for tools to run before it answers.
    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty()
            && matches!(self.finish_reason, FinishReason::ToolCalls | FinishReason::Stop)
    }
}

/// Incremental item of a streamed provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelDelta {
    Text(String),
    /// A fully reassembled tool call.
    ToolCall(ToolCall),
    Usage(Usage),
    Finish(FinishReason),
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<ModelDelta, ProviderError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Timeout,
    RateLimited,
    Server,
    Unavailable,
    Auth,
    InvalidRequest,
    NotConfigured,
    Protocol,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::Unavailable => "unavailable",
            Self::Auth => "auth",
            Self::InvalidRequest => "invalid_request",
            Self::NotConfigured => "not_configured",
            Self::Protocol => "protocol",
        }
    }
}

/// Provider failure, classified for the failover policy.
#[derive(Debug, Clone, Error)]
#[error("{}: {message}", kind.as_str())]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotConfigured, message)
    }

    /// Transient errors may succeed if the same candidate is retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Timeout
                | ProviderErrorKind::RateLimited
                | ProviderErrorKind::Server
                | ProviderErrorKind::Unavailable
        )
    }

    /// Classify an HTTP status returned by a vendor.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimited,
            401 | 403 => ProviderErrorKind::Auth,
            500..=599 => ProviderErrorKind::Server,
            400..=499 => ProviderErrorKind::InvalidRequest,
            _ => ProviderErrorKind::Protocol,
        };
        Self::new(kind, message)
    }
}

/// One model vendor binding.
pub trait ProviderAdapter: Send + Sync + 'static {
    /// Name of the configuration entry this adapter was built from.
    fn name(&self) -> &str;

    fn send(&self, request: ModelRequest) -> BoxFuture<'static, Result<ModelResponse, ProviderError>>;

    fn stream(&self, request: ModelRequest) -> BoxFuture<'static, Result<DeltaStream, ProviderError>>;
}

/// Fold a delta stream into a single response.
pub async fn collect_stream(mut stream: DeltaStream) -> Result<ModelResponse, ProviderError> {
    let mut response = ModelResponse::default();
    let mut finish = None;
    while let Some(delta) = stream.next().await {
        apply_delta(&mut response, &mut finish, delta?);
    }
    response.finish_reason = finish.unwrap_or(if response.tool_calls.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolCalls
    });
    Ok(response)
}

pub(crate) fn apply_delta(
    response: &mut ModelResponse,
    finish: &mut Option<FinishReason>,
    delta: ModelDelta,
) {
    match delta {
        ModelDelta::Text(text) => response.content.push_str(&text),
        ModelDelta::ToolCall(call) => response.tool_calls.push(call),
        ModelDelta::Usage(usage) => response.usage = usage,
        ModelDelta::Finish(reason) => *finish = Some(reason),
    }
}

/// Provider name → adapter.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one OpenAI-compatible adapter per configured provider.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let mut registry = Self::new();
        for (name, settings) in &config.providers {
            let adapter = OpenAiCompatibleProvider::from_settings(name, settings);
            registry.insert(Arc::new(adapter));
        }
        registry
    }

    /// Register an adapter under its own name, replacing any previous one.
    pub fn insert(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::not_configured(format!("unsupported provider: {name}")))
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}
