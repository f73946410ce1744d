//! Conversation turn engine
//!
//! What this module provides
//! - `Orchestrator`: runs one conversation turn end to end (preparation,
//!   admission, model/tool rounds, persistence, events, metrics)
//! - `OrchestratorBuilder`: wires providers, tools, MCP servers, skills, the
//!   store and the optional retriever from an `OrchestratorConfig`
//! - Entry points: `run_turn` (non-streaming), `run_turn_with_cancel`,
//!   `stream_turn` (events plus a cancel handle), and `tower::Service<TurnRequest>`
//! - Read models: capabilities, tools, skills, quota snapshot, metrics, conversations
//!
//! Implementation strategy
//! - One `AgentRunState` per turn, passed explicitly through the round
//!   primitives in `engine`; `legacy` and `graph` modes only differ in the driver
//! - A per-conversation lease (`lock`) is held from preparation until the
//!   terminal event, so turns on one conversation never interleave
//! - Streaming turns run on a spawned task writing into a bounded channel; the
//!   receiver going away cancels the turn

pub mod engine;
pub mod graph;
pub mod lock;
pub mod state;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::capabilities::CapabilityMatrix;
use crate::config::{OrchestratorConfig, OrchestratorMode};
use crate::error::{OrchestratorError, Result};
use crate::failover::{Candidate, FailoverPolicy};
use crate::history::{build_context, trim_history, ContextParts};
use crate::memory;
use crate::observability::{MetricsRecorder, MetricsSummary, RequestMetric};
use crate::provider::{ModelParams, ModelRequest, ProviderAdapter, ProviderRegistry, ToolSpec};
use crate::quota::{Admission, QuotaLimiter, QuotaSnapshot};
use crate::retrieval::{ContextRetriever, RetrievalQuery, RetrievedContext};
use crate::skills::{SkillCatalog, SkillProfile};
use crate::store::{ConversationStore, InMemoryConversationStore, StoredMessage};
use crate::stream::{FallbackInfo, StreamEmitter, TurnEvent};
use crate::tools::builtin::register_builtin_tools;
use crate::tools::mcp::McpBridge;
use crate::tools::{ToolDef, ToolDescriptor, ToolRegistry, ToolSource};
use crate::types::{new_id, title_from, Conversation, FinishReason, Message, Principal, ToolCall, Usage};
use engine::Engine;
use lock::{ConversationLease, ConversationLocks};
use state::{AgentRunState, RunStatus};

const EVENT_BUFFER: usize = 64;

fn default_true() -> bool {
    true
}

fn default_top_k() -> usize {
    4
}

/// One user message to run through the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub principal: Principal,
    pub message: String,
    /// Continue this conversation; a new one is created when absent.
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub skill_name: Option<String>,
    #[serde(default = "default_true")]
    pub use_tools: bool,
    /// Restrict the offered tools to these names.
    #[serde(default)]
    pub tool_names: Option<Vec<String>>,
    #[serde(default)]
    pub use_rag: bool,
    #[serde(default = "default_top_k")]
    pub rag_top_k: usize,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Lower the configured round limit for this turn.
    #[serde(default)]
    pub max_rounds: Option<u32>,
}

impl TurnRequest {
    pub fn new(principal: Principal, message: impl Into<String>) -> Self {
        Self {
            principal,
            message: message.into(),
            conversation_id: None,
            provider: None,
            model: None,
            system_prompt: None,
            skill_name: None,
            use_tools: true,
            tool_names: None,
            use_rag: false,
            rag_top_k: default_top_k(),
            temperature: None,
            max_tokens: None,
            max_rounds: None,
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.skill_name = Some(skill.into());
        self
    }

    pub fn with_tools(mut self, names: &[&str]) -> Self {
        self.tool_names = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn without_tools(mut self) -> Self {
        self.use_tools = false;
        self
    }

    pub fn with_rag(mut self, top_k: usize) -> Self {
        self.use_rag = true;
        self.rag_top_k = top_k;
        self
    }
}

/// Result of a completed non-streaming turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub conversation_id: String,
    pub provider: String,
    pub model: String,
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub tool_runs: Vec<ToolCall>,
    pub rounds: u32,
    pub fallback: Option<FallbackInfo>,
    pub retrieved: Vec<RetrievedContext>,
}

/// Events of a streaming turn; dropping it cancels the turn.
pub struct TurnStream {
    events: ReceiverStream<TurnEvent>,
    cancel: CancellationToken,
}

impl TurnStream {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Stream for TurnStream {
    type Item = TurnEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TurnEvent>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

pub(crate) struct Inner {
    pub(crate) config: OrchestratorConfig,
    pub(crate) providers: ProviderRegistry,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) quota: QuotaLimiter,
    pub(crate) failover: FailoverPolicy,
    pub(crate) store: Arc<dyn ConversationStore>,
    pub(crate) skills: SkillCatalog,
    pub(crate) retriever: Option<Arc<dyn ContextRetriever>>,
    pub(crate) metrics: MetricsRecorder,
    pub(crate) locks: ConversationLocks,
}

/// Everything a turn needs before its first round.
struct Prepared {
    state: AgentRunState,
    conversation: Conversation,
    user: Message,
    warning: Option<String>,
    retrieved: Vec<RetrievedContext>,
    is_new: bool,
    _lease: ConversationLease,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("mode", &self.inner.config.mode)
            .field("providers", &self.inner.providers.names())
            .finish()
    }
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn mode(&self) -> OrchestratorMode {
        self.inner.config.mode
    }

    /// Run a turn to completion.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
        self.run_turn_with_cancel(request, CancellationToken::new()).await
    }

    /// Run a turn that stops once `cancel` fires. The turn observes a child
    /// token, so one caller token can govern many turns.
    pub async fn run_turn_with_cancel(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let token = cancel.child_token();
        execute(self.inner.clone(), request, StreamEmitter::detached(), token, false).await
    }

    /// Run a turn on a background task, yielding its events as they happen.
    pub fn stream_turn(&self, request: TurnRequest) -> TurnStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let token = CancellationToken::new();
        let emitter = StreamEmitter::new(tx, token.clone());
        let inner = self.inner.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            // the outcome already went out as a terminal event
            let _ = execute(inner, request, emitter, task_token, true).await;
        });
        TurnStream {
            events: ReceiverStream::new(rx),
            cancel: token,
        }
    }

    pub fn capabilities(&self) -> CapabilityMatrix {
        CapabilityMatrix::compute(
            &self.inner.config,
            &self.inner.providers,
            &self.inner.tools,
            &self.inner.skills,
            self.inner.retriever.is_some(),
        )
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.inner.tools.list()
    }

    pub fn tool_registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.tools
    }

    pub fn skills(&self, owner: Option<&str>) -> Vec<SkillProfile> {
        self.inner.skills.list(owner)
    }

    pub fn skill_catalog(&self) -> &SkillCatalog {
        &self.inner.skills
    }

    pub fn quota_snapshot(&self, principal: &Principal, provider: &str, model: &str) -> QuotaSnapshot {
        self.inner.quota.snapshot(principal, provider, model)
    }

    pub fn metrics_recent(&self, owner: &str, limit: usize) -> Vec<RequestMetric> {
        self.inner.metrics.recent(owner, limit)
    }

    pub fn metrics_summary(&self, owner: &str, window: Duration) -> MetricsSummary {
        self.inner.metrics.summary(owner, window)
    }

    pub async fn conversation(&self, owner: &str, id: &str) -> Result<Conversation> {
        self.inner
            .store
            .get(owner, id)
            .await?
            .ok_or_else(|| OrchestratorError::ConversationNotFound(id.to_string()))
    }

    /// Persisted messages of a conversation owned by `owner`, oldest first.
    pub async fn messages(
        &self,
        owner: &str,
        id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        self.conversation(owner, id).await?;
        Ok(self.inner.store.messages(id, limit).await?)
    }
}

impl Service<TurnRequest> for Orchestrator {
    type Response = TurnOutcome;
    type Error = OrchestratorError;
    type Future = BoxFuture<'static, Result<TurnOutcome>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: TurnRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.run_turn(request).await })
    }
}

async fn execute(
    inner: Arc<Inner>,
    request: TurnRequest,
    mut emitter: StreamEmitter,
    cancel: CancellationToken,
    streaming: bool,
) -> Result<TurnOutcome> {
    let run_id = new_id("run");
    let span = info_span!(
        "turn",
        run_id = %run_id,
        principal = %request.principal.id,
        conversation_id = tracing::field::Empty,
        streaming,
    );
    async move {
        let started = tokio::time::Instant::now();
        let (provider, model) = inner.config.resolved_default();
        emitter.set_identity(
            request.conversation_id.as_deref().unwrap_or_default(),
            request.provider.as_deref().unwrap_or(&provider),
            request.model.as_deref().unwrap_or(&model),
        );

        let mut prepared = match inner.prepare(&request, run_id.clone(), cancel, streaming).await {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(error = %err, kind = err.kind(), "turn preparation failed");
                inner.metrics.record(RequestMetric {
                    request_id: run_id,
                    owner: request.principal.id.clone(),
                    conversation_id: request.conversation_id.clone(),
                    provider: request.provider.clone().unwrap_or(provider),
                    model: request.model.clone().unwrap_or(model),
                    is_stream: streaming,
                    success: false,
                    latency_ms: started.elapsed().as_millis() as u64,
                    usage: Usage::default(),
                    error_kind: Some(err.kind().to_string()),
                    error_message: Some(err.to_string()),
                    fallback_from: None,
                    fallback_chain: Vec::new(),
                    created_at: Utc::now(),
                });
                emitter.error(err.to_string(), err.kind()).await;
                return Err(err);
            }
        };
        tracing::Span::current().record("conversation_id", prepared.conversation.id.as_str());
        {
            let primary = prepared.state.plan.primary();
            emitter.set_identity(&prepared.conversation.id, &primary.provider, &primary.model);
        }

        let result = {
            let mut engine = Engine {
                inner: &inner,
                state: &mut prepared.state,
                emitter: &mut emitter,
                user: Some(prepared.user.clone()),
                create: prepared.is_new.then(|| prepared.conversation.clone()),
                warning: prepared.warning.take(),
            };
            match inner.config.mode {
                OrchestratorMode::Legacy => engine::run_legacy(&mut engine).await,
                OrchestratorMode::Graph => graph::run_graph(&mut engine).await,
            }
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        let state = &mut prepared.state;
        let fallback = state.fallback();

        match result {
            Ok(()) => {
                inner.touch_conversation(&mut prepared.conversation, state, &request, prepared.is_new).await;
                info!(
                    rounds = state.round,
                    provider = %state.provider,
                    model = %state.model,
                    total_tokens = state.usage.total_tokens,
                    "turn completed"
                );
                inner.metrics.record(metric(&run_id, state, streaming, latency_ms, None, fallback.as_ref()));
                emitter
                    .done(
                        state.content.clone(),
                        state.usage,
                        state.finish_reason,
                        state.provider.clone(),
                        state.model.clone(),
                        fallback.clone(),
                    )
                    .await;
                Ok(TurnOutcome {
                    conversation_id: state.conversation_id.clone(),
                    provider: state.provider.clone(),
                    model: state.model.clone(),
                    content: state.content.clone(),
                    finish_reason: state.finish_reason,
                    usage: state.usage,
                    tool_runs: state.tool_runs.clone(),
                    rounds: state.round,
                    fallback,
                    retrieved: prepared.retrieved,
                })
            }
            Err(err) => {
                let status = if err.is_cancellation() {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                if let Err(illegal) = state.transition(status) {
                    warn!(error = %illegal, "run already terminal");
                }
                inner.persist_partial(state).await;
                warn!(error = %err, kind = err.kind(), rounds = state.round, "turn ended with error");
                inner.metrics.record(metric(&run_id, state, streaming, latency_ms, Some(&err), fallback.as_ref()));
                emitter.error(err.to_string(), err.kind()).await;
                Err(err)
            }
        }
    }
    .instrument(span)
    .await
}

fn metric(
    run_id: &str,
    state: &AgentRunState,
    streaming: bool,
    latency_ms: u64,
    error: Option<&OrchestratorError>,
    fallback: Option<&FallbackInfo>,
) -> RequestMetric {
    RequestMetric {
        request_id: run_id.to_string(),
        owner: state.principal.id.clone(),
        conversation_id: Some(state.conversation_id.clone()),
        provider: state.provider.clone(),
        model: state.model.clone(),
        is_stream: streaming,
        success: error.is_none(),
        latency_ms,
        usage: state.usage,
        error_kind: error.map(|e| e.kind().to_string()),
        error_message: error.map(|e| e.to_string()),
        fallback_from: fallback.map(|f| f.from.clone()),
        fallback_chain: fallback.map(|f| f.chain.clone()).unwrap_or_default(),
        created_at: Utc::now(),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl Inner {
    async fn prepare(
        &self,
        request: &TurnRequest,
        run_id: String,
        cancel: CancellationToken,
        streaming: bool,
    ) -> Result<Prepared> {
        let owner = request.principal.id.as_str();
        let text = request.message.trim();
        if text.is_empty() {
            return Err(OrchestratorError::Config("message must not be empty".into()));
        }

        let (mut conversation, lease, is_new) = match non_empty(request.conversation_id.as_deref()) {
            Some(id) => {
                let lease = self.locks.acquire(id).await?;
                let conversation = self
                    .store
                    .get(owner, id)
                    .await?
                    .ok_or_else(|| OrchestratorError::ConversationNotFound(id.to_string()))?;
                (conversation, lease, false)
            }
            None => {
                let primary = self.resolve_candidate(request, None)?;
                let now = Utc::now();
                let conversation = Conversation {
                    id: new_id("conv"),
                    owner: owner.to_string(),
                    title: title_from(text),
                    provider: primary.provider,
                    model: primary.model,
                    system_prompt: non_empty(request.system_prompt.as_deref()).map(str::to_string),
                    skill_name: non_empty(request.skill_name.as_deref()).map(str::to_string),
                    summary: None,
                    summarized_count: 0,
                    created_at: now,
                    updated_at: now,
                };
                // written by `Engine::admit`, so a denied turn leaves nothing behind
                let lease = self.locks.acquire(&conversation.id).await?;
                (conversation, lease, true)
            }
        };

        let skill = match non_empty(request.skill_name.as_deref())
            .or(non_empty(conversation.skill_name.as_deref()))
        {
            Some(name) => Some(self.skills.require(owner, name)?),
            None => None,
        };
        let system_prompt = non_empty(request.system_prompt.as_deref())
            .or(non_empty(conversation.system_prompt.as_deref()))
            .or(skill.as_ref().and_then(|s| non_empty(Some(s.system_prompt.as_str()))))
            .map(str::to_string);
        let primary = self.resolve_candidate(request, Some(&conversation))?;
        let tools = self.resolve_tools(request, skill.as_ref())?;

        let max_history = self.config.turn.max_history_messages;
        let stored = if is_new {
            Vec::new()
        } else {
            self.store
                .messages(&conversation.id, Some(max_history))
                .await?
        };
        self.refresh_summary(&mut conversation, &stored, &request.principal, &primary, &cancel)
            .await;
        let history = trim_history(
            memory::unsummarized(stored, conversation.summarized_count),
            max_history,
        );

        let (retrieved, warning) = self
            .retrieve(request, skill.as_ref(), &conversation.id, text)
            .await;
        let user = Message::user(text);
        let messages = build_context(ContextParts {
            system_prompt,
            summary: conversation.summary.clone(),
            retrieved: retrieved.clone(),
            history,
            user: Some(user.clone()),
        });

        let params = ModelParams {
            temperature: request.temperature.or(self.config.turn.default_temperature),
            max_tokens: request.max_tokens,
        };
        let max_rounds = request
            .max_rounds
            .map(|r| r.clamp(1, self.config.turn.max_rounds))
            .unwrap_or(self.config.turn.max_rounds);
        let state = AgentRunState::new(
            run_id,
            conversation.id.clone(),
            request.principal.clone(),
            self.failover.plan(primary),
            messages,
            tools,
            params,
            max_rounds,
            cancel,
            self.config.turn.wall_clock_budget(),
            streaming,
        );
        Ok(Prepared {
            state,
            conversation,
            user,
            warning,
            retrieved,
            is_new,
            _lease: lease,
        })
    }

    /// Provider: request, then conversation, then environment default. Model:
    /// request, then the conversation's when the provider is unchanged, then
    /// the provider's default.
    fn resolve_candidate(
        &self,
        request: &TurnRequest,
        conversation: Option<&Conversation>,
    ) -> Result<Candidate> {
        let (default_provider, default_model) = self.config.resolved_default();
        let provider = non_empty(request.provider.as_deref())
            .map(str::to_ascii_lowercase)
            .or_else(|| conversation.and_then(|c| non_empty(Some(c.provider.as_str()))).map(str::to_string))
            .unwrap_or(default_provider.clone());
        if self.providers.get(&provider).is_err() {
            return Err(OrchestratorError::Config(format!(
                "unsupported provider: {provider}"
            )));
        }
        let model = non_empty(request.model.as_deref())
            .map(str::to_string)
            .or_else(|| {
                conversation
                    .filter(|c| c.provider == provider)
                    .and_then(|c| non_empty(Some(c.model.as_str())))
                    .map(str::to_string)
            })
            .or_else(|| (provider == default_provider).then(|| default_model.clone()))
            .unwrap_or_else(|| self.config.default_model_for(&provider));
        if model.is_empty() {
            return Err(OrchestratorError::Config(format!(
                "no model configured for provider {provider}"
            )));
        }
        Ok(Candidate::new(provider, model))
    }

    /// Request list, then the skill's allow-list, then everything.
    fn resolve_tools(&self, request: &TurnRequest, skill: Option<&SkillProfile>) -> Result<Vec<ToolSpec>> {
        if !request.use_tools {
            return Ok(Vec::new());
        }
        let descriptors = match request.tool_names.as_ref().filter(|names| !names.is_empty()) {
            Some(names) => self.tools.select(Some(names.as_slice()))?,
            None => match skill.filter(|s| s.restricts_tools()) {
                Some(skill) => self
                    .tools
                    .list()
                    .into_iter()
                    .filter(|d| match &d.source {
                        ToolSource::Local => skill.tool_names.contains(&d.name),
                        ToolSource::Mcp { server_id } => {
                            skill.tool_names.contains(&d.name) || skill.mcp_servers.contains(server_id)
                        }
                    })
                    .collect(),
                None => self.tools.list(),
            },
        };
        Ok(descriptors.iter().map(ToolDescriptor::to_spec).collect())
    }

    /// Retrieval never fails a turn; problems come back as a warning for `meta`.
    async fn retrieve(
        &self,
        request: &TurnRequest,
        skill: Option<&SkillProfile>,
        conversation_id: &str,
        text: &str,
    ) -> (Vec<RetrievedContext>, Option<String>) {
        let wanted = request.use_rag || skill.is_some_and(|s| s.rag_enabled);
        if !wanted {
            return (Vec::new(), None);
        }
        let Some(retriever) = &self.retriever else {
            return (
                Vec::new(),
                Some("retrieval requested but no retriever is configured".into()),
            );
        };
        let query = RetrievalQuery {
            owner: request.principal.id.clone(),
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
            top_k: request.rag_top_k.max(1),
        };
        match retriever.retrieve(query).await {
            Ok(items) => (items, None),
            Err(err) => {
                warn!(error = %err, "retrieval failed; continuing without context");
                (Vec::new(), Some(format!("retrieval failed: {err}")))
            }
        }
    }

    /// Fold aged messages into the conversation summary when a refresh is due.
    /// Failures keep the previous summary and never fail the turn.
    async fn refresh_summary(
        &self,
        conversation: &mut Conversation,
        history: &[StoredMessage],
        principal: &Principal,
        candidate: &Candidate,
        cancel: &CancellationToken,
    ) {
        let Some(plan) =
            memory::plan_refresh(&self.config.memory, history, conversation.summarized_count)
        else {
            return;
        };
        if let Admission::Deny { reason } =
            self.quota
                .check_tokens(principal, &candidate.provider, &candidate.model)
        {
            debug!(%reason, "summary refresh skipped by quota");
            return;
        }
        let adapter = match self.providers.get(&candidate.provider) {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!(error = %err, "summary refresh skipped");
                return;
            }
        };
        let request = ModelRequest {
            model: candidate.model.clone(),
            messages: memory::summary_prompt(conversation.summary.as_deref(), plan.rows),
            tools: Vec::new(),
            params: ModelParams {
                temperature: Some(0.1),
                max_tokens: None,
            },
        };
        let limit = self.config.provider_timeout(&candidate.provider);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            outcome = tokio::time::timeout(limit, adapter.send(request)) => match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    warn!(error = %err, "summary refresh failed; keeping the previous summary");
                    return;
                }
                Err(_) => {
                    warn!(timeout_ms = limit.as_millis() as u64, "summary refresh timed out");
                    return;
                }
            },
        };
        self.quota
            .record(principal, &candidate.provider, &candidate.model, &response.usage);
        let Some(summary) = memory::clean_summary(&response.content, self.config.memory.max_chars())
        else {
            return;
        };
        conversation.summary = Some(summary);
        conversation.summarized_count = plan.through;
        conversation.updated_at = Utc::now();
        match self.store.update(conversation.clone()).await {
            Ok(()) => info!(
                conversation_id = %conversation.id,
                summarized = plan.through,
                "conversation summary refreshed"
            ),
            Err(err) => warn!(error = %err, "failed to store the refreshed summary"),
        }
    }

    async fn touch_conversation(
        &self,
        conversation: &mut Conversation,
        state: &AgentRunState,
        request: &TurnRequest,
        is_new: bool,
    ) {
        conversation.provider = state.provider.clone();
        conversation.model = state.model.clone();
        if !is_new {
            if let Some(prompt) = non_empty(request.system_prompt.as_deref()) {
                conversation.system_prompt = Some(prompt.to_string());
            }
            if let Some(skill) = non_empty(request.skill_name.as_deref()) {
                conversation.skill_name = Some(skill.to_string());
            }
        }
        conversation.updated_at = Utc::now();
        if let Err(err) = self.store.update(conversation.clone()).await {
            warn!(error = %err, "failed to update conversation");
        }
    }

    async fn persist_partial(&self, state: &AgentRunState) {
        let text = state.partial_text.trim();
        if text.is_empty() {
            return;
        }
        let mut message = Message::assistant(state.partial_text.clone()).produced_by(
            &state.provider,
            &state.model,
            Usage::default(),
        );
        message.partial = true;
        if let Err(err) = self.store.append(&state.conversation_id, vec![message]).await {
            warn!(error = %err, "failed to persist partial assistant text");
        }
    }
}

/// Builds an `Orchestrator` from configuration plus injected collaborators.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    providers: Option<ProviderRegistry>,
    extra_providers: Vec<Arc<dyn ProviderAdapter>>,
    store: Option<Arc<dyn ConversationStore>>,
    tools: Vec<ToolDef>,
    builtin_tools: bool,
    retriever: Option<Arc<dyn ContextRetriever>>,
    mcp: McpBridge,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            providers: None,
            extra_providers: Vec::new(),
            store: None,
            tools: Vec::new(),
            builtin_tools: true,
            retriever: None,
            mcp: McpBridge::new(),
        }
    }

    /// Replace the registry built from configuration.
    pub fn providers(mut self, registry: ProviderRegistry) -> Self {
        self.providers = Some(registry);
        self
    }

    /// Add or replace one adapter, keyed by its name.
    pub fn provider(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.extra_providers.push(adapter);
        self
    }

    pub fn store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn tool(mut self, def: ToolDef) -> Self {
        self.tools.push(def);
        self
    }

    pub fn without_builtin_tools(mut self) -> Self {
        self.builtin_tools = false;
        self
    }

    pub fn retriever(mut self, retriever: Arc<dyn ContextRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn mcp_bridge(mut self, bridge: McpBridge) -> Self {
        self.mcp = bridge;
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let mut providers = self
            .providers
            .unwrap_or_else(|| ProviderRegistry::from_config(&config));
        for adapter in self.extra_providers {
            providers.insert(adapter);
        }

        let tools = ToolRegistry::from_config(&config.turn);
        for def in self.tools {
            tools.register(def)?;
        }
        if self.builtin_tools {
            register_builtin_tools(&tools)?;
        }
        for server in &config.mcp_servers {
            self.mcp.register_server(&tools, server)?;
        }

        let skills = SkillCatalog::with_skills(config.skills.clone())?;
        let inner = Inner {
            quota: QuotaLimiter::new(&config.quota),
            failover: FailoverPolicy::from_config(&config),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryConversationStore::new())),
            skills,
            retriever: self.retriever,
            metrics: MetricsRecorder::new(config.observability.metrics_capacity),
            locks: ConversationLocks::new(config.turn.busy_policy, config.turn.busy_wait()),
            providers,
            tools: Arc::new(tools),
            config,
        };
        info!(
            mode = inner.config.mode.as_str(),
            providers = ?inner.providers.names(),
            tools = inner.tools.list().len(),
            "orchestrator ready"
        );
        Ok(Orchestrator {
            inner: Arc::new(inner),
        })
    }
}
