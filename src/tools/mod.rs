//! Tool registry: schemas, executors and concurrent dispatch
//!
//! What this module provides
//! - Name → (description, JSON schema, executor) registration, local or bridged from MCP
//! - Argument validation before any executor runs
//! - A uniform per-call deadline and failure capture
//! - Concurrent batch execution whose results come back in proposal order
//!
//! Exports
//! - Models: `ToolDef`, `ToolDescriptor`, `ToolSource`, `ToolError`
//! - Services: `ToolExecutor = BoxCloneSyncService<Value, Value, BoxError>`
//! - Utils: `tool_fn` (JSON handler), `tool_typed` (schema derived with `schemars`)
//!
//! Implementation strategy
//! - Executors are plain tower services; the registry wraps each one with
//!   `tower::timeout::TimeoutLayer` at registration time and clones it per call
//! - Batches spawn one task per call behind a semaphore and write results into
//!   index slots, so completion order never leaks into the history
//! - Cancellation races the whole batch; in-flight tasks are aborted and their
//!   results discarded
//!
//! Testing strategy
//! - Counting executors prove validation short-circuits
//! - Latency-skewed executors prove ordering and the concurrency bound

pub mod builtin;
pub mod mcp;
pub mod schema;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower::util::BoxCloneSyncService;
use tower::timeout::error::Elapsed;
use tower::timeout::TimeoutLayer;
use tower::{BoxError, Layer, ServiceExt};
use tracing::{debug, info_span, warn, Instrument};

use crate::config::TurnConfig;
use crate::provider::ToolSpec;
use crate::types::ToolCall;

/// Boxed tool executor.
pub type ToolExecutor = BoxCloneSyncService<Value, Value, BoxError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolSource {
    Local,
    Mcp { server_id: String },
}

/// Public description of a registered tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub source: ToolSource,
}

impl ToolDescriptor {
    pub fn to_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("tool {0} is already registered")]
    Duplicate(String),

    #[error("invalid arguments for tool `{tool}`: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool `{tool}` failed: {reason}")]
    Execution { tool: String, reason: String },

    #[error("tool `{tool}` timed out after {}ms", after.as_millis())]
    Timeout { tool: String, after: Duration },

    #[error("tool dispatch cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::Unknown(name) | Self::Duplicate(name) => Some(name),
            Self::InvalidArguments { tool, .. }
            | Self::Execution { tool, .. }
            | Self::Timeout { tool, .. } => Some(tool),
            Self::Cancelled => None,
        }
    }
}

/// Raised by typed executors whose arguments passed the schema but failed to decode.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ArgumentDecodeError(pub String);

/// Definition of a tool before registration.
pub struct ToolDef {
    pub descriptor: ToolDescriptor,
    pub executor: ToolExecutor,
    pub timeout: Option<Duration>,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        executor: ToolExecutor,
    ) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: name.into(),
                description: description.into(),
                parameters,
                source: ToolSource::Local,
            },
            executor,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_source(mut self, source: ToolSource) -> Self {
        self.descriptor.source = source;
        self
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Create a tool from an async handler over raw JSON arguments.
pub fn tool_fn<F, Fut>(
    name: impl Into<String>,
    description: impl Into<String>,
    parameters: Value,
    handler: F,
) -> ToolDef
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let svc = tower::service_fn(move |args: Value| {
        let handler = handler.clone();
        async move { (handler.as_ref())(args).await }
    });
    ToolDef::new(name, description, parameters, BoxCloneSyncService::new(svc))
}

/// Create a tool from a typed handler.
/// - `A` is the argument struct; its schema is derived with `schemars`
/// - `R` is any serializable output
pub fn tool_typed<A, R, H, Fut>(
    name: impl Into<String>,
    description: impl Into<String>,
    handler: H,
) -> ToolDef
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
    R: Serialize + Send + 'static,
    H: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
{
    // the root keeps `definitions`, which nested argument structs point into
    let schema = schemars::schema_for!(A);
    let parameters =
        serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}));
    let handler = Arc::new(handler);
    tool_fn(name, description, parameters, move |raw: Value| {
        let handler = handler.clone();
        async move {
            let args: A = serde_json::from_value(raw)
                .map_err(|e| Box::new(ArgumentDecodeError(e.to_string())) as BoxError)?;
            let out = (handler.as_ref())(args).await?;
            Ok::<Value, BoxError>(serde_json::to_value(out)?)
        }
    })
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    executor: ToolExecutor,
    timeout: Duration,
}

/// An executor resolved for one call, with the deadline it runs under.
struct Prepared {
    name: String,
    executor: ToolExecutor,
    timeout: Duration,
}

/// Registry of every tool a turn may offer to the model.
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, RegisteredTool>>,
    default_timeout: Duration,
    overrides: BTreeMap<String, Duration>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

impl ToolRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            tools: RwLock::new(BTreeMap::new()),
            default_timeout,
            overrides: BTreeMap::new(),
        }
    }

    /// Registry using the default and per-tool timeouts of `turn`.
    pub fn from_config(turn: &TurnConfig) -> Self {
        let mut registry = Self::new(turn.tool_timeout());
        registry.overrides = turn
            .tool_timeouts
            .iter()
            .map(|(name, secs)| (name.clone(), Duration::from_secs(*secs)))
            .collect();
        registry
    }

    pub fn register(&self, def: ToolDef) -> Result<(), ToolError> {
        let name = def.descriptor.name.clone();
        let timeout = self
            .overrides
            .get(&name)
            .copied()
            .or(def.timeout)
            .unwrap_or(self.default_timeout);
        let executor = BoxCloneSyncService::new(TimeoutLayer::new(timeout).layer(def.executor));

        let mut tools = self.tools.write().unwrap_or_else(|p| p.into_inner());
        if tools.contains_key(&name) {
            return Err(ToolError::Duplicate(name));
        }
        debug!(tool = %name, timeout_ms = timeout.as_millis() as u64, "tool registered");
        tools.insert(
            name,
            RegisteredTool {
                descriptor: def.descriptor,
                executor,
                timeout,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.read().values().map(|t| t.descriptor.clone()).collect()
    }

    /// Descriptors for `names`, or every tool when `names` is `None`.
    pub fn select(&self, names: Option<&[String]>) -> Result<Vec<ToolDescriptor>, ToolError> {
        let tools = self.read();
        match names {
            None => Ok(tools.values().map(|t| t.descriptor.clone()).collect()),
            Some(names) => names
                .iter()
                .map(|name| {
                    tools
                        .get(name)
                        .map(|t| t.descriptor.clone())
                        .ok_or_else(|| ToolError::Unknown(name.clone()))
                })
                .collect(),
        }
    }

    /// Validate `arguments` and execute one tool.
    pub async fn execute(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let prepared = self.prepare(name, &arguments)?;
        run_executor(prepared, arguments).await
    }

    /// Execute a round's tool calls concurrently, returning them resolved in
    /// the order they were proposed.
    ///
    /// Every call is validated before any executor starts; an invalid call
    /// fails the whole batch with `InvalidArguments`. Execution failures,
    /// timeouts and unknown tools resolve the call as failed instead.
    pub async fn execute_batch(
        &self,
        calls: Vec<ToolCall>,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolCall>, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let mut prepared = Vec::with_capacity(calls.len());
        for call in &calls {
            match self.prepare(&call.name, &call.arguments) {
                Ok(ready) => prepared.push(Some(ready)),
                Err(ToolError::Unknown(_)) => prepared.push(None),
                Err(err) => return Err(err),
            }
        }

        let sem = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut handles = Vec::with_capacity(calls.len());
        for (idx, (call, ready)) in calls.iter().zip(prepared).enumerate() {
            let sem = sem.clone();
            let name = call.name.clone();
            let arguments = call.arguments.clone();
            let span = info_span!("tool_call", tool = %call.name, call_id = %call.id);
            handles.push(tokio::spawn(
                async move {
                    let Some(ready) = ready else {
                        return (idx, Err(ToolError::Unknown(name)));
                    };
                    let _permit = match sem.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return (idx, Err(ToolError::Cancelled)),
                    };
                    (idx, run_executor(ready, arguments).await)
                }
                .instrument(span),
            ));
        }
        // also fires when the caller drops this future, e.g. on a turn timeout
        let _aborts = AbortOnDrop(handles.iter().map(|h| h.abort_handle()).collect());

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ToolError::Cancelled),
            joined = futures::future::join_all(handles) => joined,
        };

        let mut slots: Vec<Option<Result<Value, ToolError>>> = vec![None; calls.len()];
        for outcome in joined {
            match outcome {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(join_err) => warn!(error = %join_err, "tool task did not complete"),
            }
        }

        let mut resolved = calls;
        for (call, slot) in resolved.iter_mut().zip(slots) {
            match slot {
                Some(Ok(value)) => call.succeed(value),
                Some(Err(err)) => call.fail(err.to_string()),
                None => call.fail("tool task aborted"),
            }
        }
        Ok(resolved)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, RegisteredTool>> {
        self.tools.read().unwrap_or_else(|p| p.into_inner())
    }

    fn prepare(&self, name: &str, arguments: &Value) -> Result<Prepared, ToolError> {
        let tools = self.read();
        let tool = tools
            .get(name)
            .ok_or_else(|| ToolError::Unknown(name.to_string()))?;
        schema::validate(&tool.descriptor.parameters, arguments).map_err(|v| {
            ToolError::InvalidArguments {
                tool: name.to_string(),
                reason: v.to_string(),
            }
        })?;
        Ok(Prepared {
            name: name.to_string(),
            executor: tool.executor.clone(),
            timeout: tool.timeout,
        })
    }
}

struct AbortOnDrop(Vec<tokio::task::AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

async fn run_executor(prepared: Prepared, arguments: Value) -> Result<Value, ToolError> {
    let Prepared {
        name,
        executor,
        timeout,
    } = prepared;
    executor.oneshot(arguments).await.map_err(|err| {
        if err.is::<Elapsed>() {
            ToolError::Timeout {
                tool: name,
                after: timeout,
            }
        } else if let Some(decode) = err.downcast_ref::<ArgumentDecodeError>() {
            ToolError::InvalidArguments {
                tool: name,
                reason: decode.0.clone(),
            }
        } else {
            ToolError::Execution {
                tool: name,
                reason: err.to_string(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCallStatus;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn object_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"n": {"type": "integer"}},
            "required": ["n"]
        })
    }

    fn counting_tool(counter: Arc<AtomicUsize>) -> ToolDef {
        tool_fn("count", "Counts calls", object_schema(), move |args: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(args)
            }
        })
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let reg = ToolRegistry::default();
        let counter = Arc::new(AtomicUsize::new(0));
        reg.register(counting_tool(counter.clone())).unwrap();
        let err = reg.register(counting_tool(counter)).unwrap_err();
        assert!(matches!(err, ToolError::Duplicate(name) if name == "count"));
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_the_executor() {
        let reg = ToolRegistry::default();
        let counter = Arc::new(AtomicUsize::new(0));
        reg.register(counting_tool(counter.clone())).unwrap();

        let err = reg.execute("count", json!({"n": "3"})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert_eq!(reg.execute("count", json!({"n": 3})).await.unwrap(), json!({"n": 3}));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let reg = ToolRegistry::new(Duration::from_secs(2));
        reg.register(tool_fn("slow", "", json!({}), |_| async {
            sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        }))
        .unwrap();
        let err = reg.execute("slow", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { after, .. } if after == Duration::from_secs(2)));
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn typed_tool_derives_schema() {
        let reg = ToolRegistry::default();
        reg.register(tool_typed("add", "Add", |args: AddArgs| async move {
            Ok::<_, BoxError>(json!({"sum": args.a + args.b}))
        }))
        .unwrap();
        let desc = &reg.list()[0];
        assert_eq!(desc.parameters["type"], "object");
        assert_eq!(desc.source, ToolSource::Local);
        assert_eq!(reg.execute("add", json!({"a": 2, "b": 3})).await.unwrap()["sum"], 5);
        assert!(matches!(
            reg.execute("add", json!({"a": 2})).await.unwrap_err(),
            ToolError::InvalidArguments { .. }
        ));
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Window {
        start: u32,
        end: u32,
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct ScheduleArgs {
        title: String,
        window: Window,
    }

    #[tokio::test]
    async fn typed_tool_validates_nested_structs_before_running() {
        let reg = ToolRegistry::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        reg.register(tool_typed("schedule", "Book a window", move |args: ScheduleArgs| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(json!({"title": args.title, "len": args.window.end - args.window.start}))
            }
        }))
        .unwrap();
        assert!(reg.list()[0].parameters["definitions"]["Window"].is_object());

        let err = reg
            .execute("schedule", json!({"title": "standup", "window": {"start": "9", "end": 10}}))
            .await
            .unwrap_err();
        match err {
            ToolError::InvalidArguments { reason, .. } => assert!(reason.starts_with("$.window.start")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let out = reg
            .execute("schedule", json!({"title": "standup", "window": {"start": 9, "end": 10}}))
            .await
            .unwrap();
        assert_eq!(out["len"], 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn select_rejects_unknown_names() {
        let reg = ToolRegistry::default();
        reg.register(counting_tool(Arc::new(AtomicUsize::new(0)))).unwrap();
        assert_eq!(reg.select(None).unwrap().len(), 1);
        let err = reg.select(Some(&["nope".to_string()])).unwrap_err();
        assert!(matches!(err, ToolError::Unknown(_)));
    }

    fn delayed_registry() -> ToolRegistry {
        let reg = ToolRegistry::default();
        reg.register(tool_fn(
            "wait",
            "Sleeps for `ms` then echoes it",
            json!({"type": "object", "properties": {"ms": {"type": "integer"}}}),
            |args: Value| async move {
                let ms = args["ms"].as_u64().unwrap_or(0);
                sleep(Duration::from_millis(ms)).await;
                if ms == 13 {
                    return Err::<Value, BoxError>("unlucky".into());
                }
                Ok(json!(ms))
            },
        ))
        .unwrap();
        reg
    }

    #[tokio::test(start_paused = true)]
    async fn batch_preserves_proposal_order() {
        let reg = delayed_registry();
        let calls = vec![
            ToolCall::pending("a", "wait", json!({"ms": 50})),
            ToolCall::pending("b", "wait", json!({"ms": 5})),
            ToolCall::pending("c", "wait", json!({"ms": 20})),
        ];
        let out = reg.execute_batch(calls, 3, &CancellationToken::new()).await.unwrap();
        let ids: Vec<_> = out.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(out[0].result, Some(json!(50)));
        assert!(out.iter().all(|c| c.status == ToolCallStatus::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_failures_and_unknown_tools_resolve_as_failed() {
        let reg = delayed_registry();
        let calls = vec![
            ToolCall::pending("a", "wait", json!({"ms": 13})),
            ToolCall::pending("b", "missing", json!({})),
            ToolCall::pending("c", "wait", json!({"ms": 1})),
        ];
        let out = reg.execute_batch(calls, 2, &CancellationToken::new()).await.unwrap();
        assert_eq!(out[0].status, ToolCallStatus::Failed);
        assert!(out[0].error.as_deref().unwrap().contains("unlucky"));
        assert_eq!(out[1].status, ToolCallStatus::Failed);
        assert!(out[1].error.as_deref().unwrap().contains("unknown tool"));
        assert_eq!(out[2].status, ToolCallStatus::Succeeded);
    }

    #[tokio::test]
    async fn batch_validation_fails_fast() {
        let reg = ToolRegistry::default();
        let counter = Arc::new(AtomicUsize::new(0));
        reg.register(counting_tool(counter.clone())).unwrap();
        let calls = vec![
            ToolCall::pending("a", "count", json!({"n": 1})),
            ToolCall::pending("b", "count", json!({"n": "x"})),
        ];
        let err = reg.execute_batch(calls, 2, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn batch_respects_concurrency_limit() {
        static CURRENT: AtomicUsize = AtomicUsize::new(0);
        static MAX_OBSERVED: AtomicUsize = AtomicUsize::new(0);
        let reg = ToolRegistry::default();
        reg.register(tool_fn("busy", "", json!({}), |_| async {
            let now = CURRENT.fetch_add(1, Ordering::SeqCst) + 1;
            MAX_OBSERVED.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(10)).await;
            CURRENT.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }))
        .unwrap();
        let calls = (0..8)
            .map(|i| ToolCall::pending(format!("c{i}"), "busy", json!({})))
            .collect();
        reg.execute_batch(calls, 2, &CancellationToken::new()).await.unwrap();
        assert!(MAX_OBSERVED.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_in_flight_tools() {
        let reg = delayed_registry();
        let token = CancellationToken::new();
        let handle = token.clone();
        let calls = vec![ToolCall::pending("a", "wait", json!({"ms": 60_000}))];
        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });
        let err = reg.execute_batch(calls, 1, &token).await.unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
        canceller.await.unwrap();
    }
}
