//! Deterministic provider that replays a script, for tests and demos.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};

use super::{
    collect_stream, DeltaStream, ModelDelta, ModelRequest, ModelResponse, ProviderAdapter,
    ProviderError,
};
use crate::types::{ToolCall, Usage};

/// One scripted reaction, consumed per call.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(ModelResponse),
    Fail(ProviderError),
    /// Streamed as-is; `send` folds it and stops at the first error.
    Deltas(Vec<Result<ModelDelta, ProviderError>>),
    /// Never completes; exercises timeouts and cancellation.
    Hang,
}

/// Provider that pops one `ScriptStep` per call.
///
/// When the script runs dry it answers `"Default response"`.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<ModelRequest>>,
    calls: AtomicUsize,
    delta_delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delta_delay: None,
        }
    }

    pub fn then(self, step: ScriptStep) -> Self {
        lock(&self.script).push_back(step);
        self
    }

    pub fn then_text(self, content: impl Into<String>) -> Self {
        self.then(ScriptStep::Respond(ModelResponse::text(
            content,
            Usage::new(10, 5, 15),
        )))
    }

    pub fn then_tool_calls(self, calls: Vec<ToolCall>) -> Self {
        self.then(ScriptStep::Respond(ModelResponse::tool_calls(
            calls,
            Usage::new(12, 4, 16),
        )))
    }

    pub fn then_fail(self, err: ProviderError) -> Self {
        self.then(ScriptStep::Fail(err))
    }

    /// Sleep between streamed deltas.
    pub fn with_delta_delay(mut self, delay: Duration) -> Self {
        self.delta_delay = Some(delay);
        self
    }

    /// Number of calls received so far, `send` and `stream` combined.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.requests).clone()
    }

    fn next_step(&self, request: ModelRequest) -> ScriptStep {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request);
        lock(&self.script).pop_front().unwrap_or_else(|| {
            ScriptStep::Respond(ModelResponse::text("Default response", Usage::new(10, 5, 15)))
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Split a response into the deltas a streaming vendor would send.
fn response_deltas(response: ModelResponse) -> Vec<Result<ModelDelta, ProviderError>> {
    let mut deltas: Vec<Result<ModelDelta, ProviderError>> = response
        .content
        .split_inclusive(' ')
        .map(|piece| Ok(ModelDelta::Text(piece.to_string())))
        .collect();
    deltas.extend(response.tool_calls.into_iter().map(|c| Ok(ModelDelta::ToolCall(c))));
    deltas.push(Ok(ModelDelta::Usage(response.usage)));
    deltas.push(Ok(ModelDelta::Finish(response.finish_reason)));
    deltas
}

impl ProviderAdapter for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, request: ModelRequest) -> BoxFuture<'static, Result<ModelResponse, ProviderError>> {
        let step = self.next_step(request);
        Box::pin(async move {
            match step {
                ScriptStep::Respond(response) => Ok(response),
                ScriptStep::Fail(err) => Err(err),
                ScriptStep::Deltas(deltas) => collect_stream(Box::pin(stream::iter(deltas))).await,
                ScriptStep::Hang => futures::future::pending().await,
            }
        })
    }

    fn stream(&self, request: ModelRequest) -> BoxFuture<'static, Result<DeltaStream, ProviderError>> {
        let step = self.next_step(request);
        let delay = self.delta_delay;
        Box::pin(async move {
            let deltas = match step {
                ScriptStep::Respond(response) => response_deltas(response),
                ScriptStep::Fail(err) => return Err(err),
                ScriptStep::Deltas(deltas) => deltas,
                ScriptStep::Hang => futures::future::pending().await,
            };
            let stream: DeltaStream = match delay {
                Some(delay) => Box::pin(stream::iter(deltas).then(move |delta| async move {
                    tokio::time::sleep(delay).await;
                    delta
                })),
                None => Box::pin(stream::iter(deltas)),
            };
            Ok(stream)
        })
    }
}
