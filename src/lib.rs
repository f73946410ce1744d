//! # tower-turns
//!
//! Orchestration core for multi-turn, tool-calling LLM conversations.
//!
//! A turn takes one user message through quota admission, one or more model
//! rounds (with concurrent tool execution between them), provider failover and
//! persistence, and reports progress either as a final `TurnOutcome` or as a
//! stream of `meta`/`delta`/`done`/`error` events.
//!
//! ## Core Concepts
//!
//! - **Provider**: one model vendor behind `ProviderAdapter`, normalized to
//!   text, tool calls, finish reason and usage
//! - **Tools**: tower services registered by name with a JSON schema; arguments
//!   are validated before any executor runs
//! - **Failover**: ordered fallback chains with bounded retries for transient errors
//! - **Quota**: rolling request and token windows per principal, provider and model
//! - **Orchestrator**: the turn engine, itself a `tower::Service<TurnRequest>`
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tower_turns::{
//!     ConfigBuilder, Orchestrator, Principal, ScriptedProvider, TurnRequest,
//! };
//!
//! # async fn example() -> tower_turns::Result<()> {
//! let config = ConfigBuilder::new().quota_enabled(false).build();
//! let orchestrator = Orchestrator::builder(config)
//!     .provider(Arc::new(ScriptedProvider::new("openai").then_text("4")))
//!     .build()?;
//!
//! let outcome = orchestrator
//!     .run_turn(TurnRequest::new(Principal::new("alice", "default"), "What is 2 + 2?"))
//!     .await?;
//! println!("{}: {}", outcome.model, outcome.content);
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod config;
pub mod error;
pub mod failover;
pub mod history;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod provider;
pub mod quota;
pub mod retrieval;
pub mod skills;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod tools;
pub mod types;

pub use capabilities::CapabilityMatrix;
pub use config::{BusyPolicy, ConfigBuilder, MemoryConfig, OrchestratorConfig, OrchestratorMode};
pub use error::{OrchestratorError, Result};
pub use failover::{Candidate, FailoverPolicy};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, TurnOutcome, TurnRequest, TurnStream};
pub use provider::{
    ModelResponse, ProviderAdapter, ProviderError, ProviderErrorKind, ProviderRegistry,
    ScriptStep, ScriptedProvider,
};
pub use quota::QuotaLimiter;
pub use skills::{SkillCatalog, SkillProfile};
pub use store::{ConversationStore, InMemoryConversationStore, StoredMessage};
pub use stream::{FallbackInfo, TurnEvent};
pub use tools::{tool_fn, tool_typed, ToolDef, ToolRegistry};
pub use types::{Conversation, FinishReason, Message, Principal, Role, ToolCall, Usage};

/// Cooperative cancellation shared by turns, streams and tool dispatch.
pub use tokio_util::sync::CancellationToken;
