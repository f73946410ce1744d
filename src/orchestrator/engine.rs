//! Round primitives shared by both drivers, and the legacy loop driver.
//!
//! A turn is `admit`, then rounds of `call_model` followed by either
//! `dispatch_tools` (and another round) or `finish`. The primitives own every
//! side effect of a round: quota accounting, persistence, event emission and
//! failover. Drivers only decide what runs next.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, info_span, warn, Instrument};

use super::state::{AgentRunState, RunStatus};
use super::Inner;
use crate::error::{OrchestratorError, Result};
use crate::failover::{Candidate, FailoverDecision};
use crate::provider::{
    apply_delta, ModelDelta, ModelRequest, ModelResponse, ProviderAdapter, ProviderError,
    ProviderErrorKind,
};
use crate::quota::Admission;
use crate::stream::StreamEmitter;
use crate::types::{Conversation, FinishReason, Message, ToolCall, Usage};

/// What a model response asks for.
pub(crate) enum Step {
    Tools(ModelResponse),
    Finish(ModelResponse),
}

/// How one provider call failed.
enum CallFailure {
    /// Eligible for retry or failover.
    Provider(ProviderError),
    /// The provider failed after text reached the caller; no failover.
    AfterOutput {
        error: ProviderError,
        partial: ModelResponse,
    },
    /// Ends the turn regardless of the failover plan. `partial` is what a
    /// stream had produced when it was cut off.
    Turn {
        error: OrchestratorError,
        partial: Option<ModelResponse>,
    },
}

impl CallFailure {
    fn turn(error: OrchestratorError) -> Self {
        Self::Turn {
            error,
            partial: None,
        }
    }

    /// Attach the response a stream had accumulated when it failed.
    fn with_partial(self, response: &ModelResponse, emitted: bool) -> Self {
        match self {
            Self::Provider(error) if emitted => Self::AfterOutput {
                error,
                partial: response.clone(),
            },
            Self::Turn { error, .. } => Self::Turn {
                error,
                partial: Some(response.clone()),
            },
            other => other,
        }
    }
}

pub(crate) struct Engine<'a> {
    pub(crate) inner: &'a Inner,
    pub(crate) state: &'a mut AgentRunState,
    pub(crate) emitter: &'a mut StreamEmitter,
    /// User message, persisted once admission succeeds.
    pub(crate) user: Option<Message>,
    /// New conversation, created once admission succeeds.
    pub(crate) create: Option<Conversation>,
    /// Carried on `meta`.
    pub(crate) warning: Option<String>,
}

impl Engine<'_> {
    /// Admit the primary candidate, persist the user message and open the stream.
    pub(crate) async fn admit(&mut self) -> Result<()> {
        self.checkpoint()?;
        let primary = self.state.plan.primary().clone();
        let estimate = estimate_tokens(&self.state.messages);
        match self.inner.quota.admit(
            &self.state.principal,
            &primary.provider,
            &primary.model,
            estimate,
        ) {
            Admission::Allow => {
                self.state.admitted.insert(primary.label());
            }
            Admission::Deny { reason } => {
                info!(candidate = %primary.label(), %reason, "turn denied by quota");
                return Err(OrchestratorError::QuotaExceeded { reason });
            }
        }
        if let Some(conversation) = self.create.take() {
            self.inner.store.create(conversation).await?;
            info!(conversation_id = %self.state.conversation_id, "conversation created");
        }
        if let Some(user) = self.user.take() {
            self.inner
                .store
                .append(&self.state.conversation_id, vec![user])
                .await?;
        }
        self.state.transition(RunStatus::Running)?;
        self.emitter.meta(self.warning.take()).await;
        Ok(())
    }

    /// Start the next round, enforcing the round limit.
    pub(crate) fn begin_round(&mut self) -> Result<()> {
        if self.state.round >= self.state.max_rounds {
            return Err(OrchestratorError::RunIterationLimit {
                max_rounds: self.state.max_rounds,
            });
        }
        self.state.round += 1;
        self.state.partial_text.clear();
        self.state.transition(RunStatus::Running)
    }

    /// One model call, walking the failover plan until a candidate answers.
    pub(crate) async fn call_model(&mut self) -> Result<ModelResponse> {
        let mut last: Option<(Candidate, ProviderError)> = None;
        loop {
            self.checkpoint()?;
            let Some(candidate) = self.state.plan.current().cloned() else {
                return Err(self.exhausted(last));
            };
            let label = candidate.label();

            if !self.state.admitted.contains(&label) {
                let estimate = estimate_tokens(&self.state.messages);
                let admission = self.inner.quota.admit(
                    &self.state.principal,
                    &candidate.provider,
                    &candidate.model,
                    estimate,
                );
                if let Admission::Deny { reason } = admission {
                    warn!(candidate = %label, %reason, "fallback candidate denied by quota");
                    last = Some((
                        candidate,
                        ProviderError::new(ProviderErrorKind::RateLimited, format!("quota: {reason}")),
                    ));
                    if self.state.plan.skip() == FailoverDecision::Exhausted {
                        return Err(self.exhausted(last));
                    }
                    continue;
                }
                self.state.admitted.insert(label.clone());
            } else if self.state.round > 1 {
                let admission = self.inner.quota.check_tokens(
                    &self.state.principal,
                    &candidate.provider,
                    &candidate.model,
                );
                if let Admission::Deny { reason } = admission {
                    return Err(OrchestratorError::QuotaExceeded { reason });
                }
            }

            let attempt = self.state.plan.attempt();
            let span = info_span!(
                "provider_call",
                provider = %candidate.provider,
                model = %candidate.model,
                attempt,
                streaming = self.state.streaming,
            );
            match self.attempt(&candidate).instrument(span).await {
                Ok(response) => {
                    self.inner.quota.record(
                        &self.state.principal,
                        &candidate.provider,
                        &candidate.model,
                        &response.usage,
                    );
                    self.state.usage += response.usage;
                    self.state.provider = candidate.provider;
                    self.state.model = candidate.model;
                    self.state.plan.reset_attempts();
                    return Ok(response);
                }
                Err(CallFailure::Turn { error, partial }) => {
                    if let Some(partial) = partial {
                        self.charge_partial(&candidate, &partial);
                    }
                    return Err(error);
                }
                Err(CallFailure::AfterOutput { error, partial }) => {
                    warn!(candidate = %label, error = %error, "provider failed mid-stream");
                    self.charge_partial(&candidate, &partial);
                    return Err(OrchestratorError::from_provider(
                        &candidate.provider,
                        &candidate.model,
                        &error,
                    ));
                }
                Err(CallFailure::Provider(err)) => {
                    warn!(candidate = %label, attempt, error = %err, "provider call failed");
                    let decision = self.state.plan.on_failure(&err);
                    last = Some((candidate, err));
                    match decision {
                        FailoverDecision::RetrySameAfter(delay) => self.pause(delay).await?,
                        FailoverDecision::Advance => {
                            if let Some(next) = self.state.plan.current() {
                                info!(from = %label, to = %next.label(), "failing over");
                            }
                        }
                        FailoverDecision::Exhausted => return Err(self.exhausted(last)),
                    }
                }
            }
        }
    }

    /// Decide what a model response asks for.
    pub(crate) fn classify(&self, response: ModelResponse) -> Result<Step> {
        if response.wants_tools() {
            return Ok(Step::Tools(response));
        }
        if response.finish_reason == FinishReason::Error {
            return Err(OrchestratorError::ProviderFatal {
                provider: self.state.provider.clone(),
                model: self.state.model.clone(),
                message: "provider reported finish_reason=error".into(),
            });
        }
        Ok(Step::Finish(response))
    }

    /// Run the round's tool calls and persist the assistant message together
    /// with every tool result.
    pub(crate) async fn dispatch_tools(&mut self, response: ModelResponse) -> Result<()> {
        // kept if the turn ends before the round is persisted
        self.state.partial_text = response.content.clone();
        self.checkpoint()?;

        let mut resolved = response.tool_calls.clone();
        let mut offered_idx = Vec::new();
        let mut offered = Vec::new();
        for (idx, call) in resolved.iter_mut().enumerate() {
            if self.state.offered.contains(&call.name) {
                offered_idx.push(idx);
                offered.push(call.clone());
            } else {
                warn!(tool = %call.name, "model called a tool that was not offered");
                call.fail(format!("unknown tool: {}", call.name));
            }
        }
        debug!(calls = resolved.len(), offered = offered.len(), "dispatching tools");

        let batch = self.inner.tools.execute_batch(
            offered,
            self.inner.config.turn.tool_concurrency,
            &self.state.cancel,
        );
        let executed = match timeout(self.state.remaining(), batch).await {
            Err(_) => {
                return Err(OrchestratorError::TurnTimeout {
                    budget: self.state.budget,
                })
            }
            Ok(result) => result?,
        };
        for (idx, call) in offered_idx.into_iter().zip(executed) {
            resolved[idx] = call;
        }

        let assistant = Message::assistant_with_tools(response.content, resolved.clone())
            .produced_by(&self.state.provider, &self.state.model, response.usage);
        let mut round = Vec::with_capacity(resolved.len() + 1);
        round.push(assistant);
        round.extend(resolved.iter().map(Message::tool_result));
        self.inner
            .store
            .append(&self.state.conversation_id, round.clone())
            .await?;
        self.state.messages.extend(round);
        self.state.tool_runs.extend(resolved);
        self.state.partial_text.clear();
        Ok(())
    }

    /// Persist the final answer and complete the run.
    pub(crate) async fn finish(&mut self, response: ModelResponse) -> Result<()> {
        let message = Message::assistant(response.content.clone()).produced_by(
            &self.state.provider,
            &self.state.model,
            response.usage,
        );
        self.inner
            .store
            .append(&self.state.conversation_id, vec![message.clone()])
            .await?;
        self.state.messages.push(message);
        self.state.partial_text.clear();
        self.state.content = response.content;
        self.state.finish_reason = response.finish_reason;
        self.state.transition(RunStatus::Completed)
    }

    fn checkpoint(&self) -> Result<()> {
        if self.state.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        if self.state.past_deadline() {
            return Err(OrchestratorError::TurnTimeout {
                budget: self.state.budget,
            });
        }
        Ok(())
    }

    /// Backoff sleep that still honors cancellation and the turn deadline.
    async fn pause(&self, delay: Duration) -> Result<()> {
        let remaining = self.state.remaining();
        tokio::select! {
            biased;
            _ = self.state.cancel.cancelled() => Err(OrchestratorError::Cancelled),
            _ = sleep(delay.min(remaining)) => {
                if delay >= remaining {
                    Err(OrchestratorError::TurnTimeout { budget: self.state.budget })
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Terminal error once the plan has no candidate left, single-candidate
    /// plans included. The last classified failure is kept as `last_error`.
    fn exhausted(&self, last: Option<(Candidate, ProviderError)>) -> OrchestratorError {
        let last_error = match last {
            Some((candidate, err)) => {
                OrchestratorError::from_provider(&candidate.provider, &candidate.model, &err)
                    .to_string()
            }
            None => "no candidate available".into(),
        };
        OrchestratorError::ProviderExhausted {
            chain: self.state.plan.chain().to_vec(),
            last_error,
        }
    }

    /// Account for a stream cut off by an error or cancellation. Vendors often
    /// send usage only at the end, so missing counts are estimated from the
    /// prompt and the text streamed so far.
    fn charge_partial(&mut self, candidate: &Candidate, partial: &ModelResponse) {
        let mut usage = partial.usage;
        if usage.is_empty() {
            if self.state.partial_text.is_empty() {
                return;
            }
            let prompt = estimate_tokens(&self.state.messages);
            let completion = (self.state.partial_text.chars().count() as u64).div_ceil(4);
            usage = Usage::new(prompt, completion, 0);
        }
        debug!(
            candidate = %candidate.label(),
            total_tokens = usage.total_tokens,
            "charging partial stream"
        );
        self.inner
            .quota
            .record(&self.state.principal, &candidate.provider, &candidate.model, &usage);
        self.state.usage += usage;
    }

    async fn attempt(&mut self, candidate: &Candidate) -> std::result::Result<ModelResponse, CallFailure> {
        let adapter = self
            .inner
            .providers
            .get(&candidate.provider)
            .map_err(CallFailure::Provider)?;
        let request = ModelRequest {
            model: candidate.model.clone(),
            messages: self.state.messages.clone(),
            tools: self.state.tools.clone(),
            params: self.state.params.clone(),
        };
        let per_call = self.inner.config.provider_timeout(&candidate.provider);
        if self.state.streaming {
            self.stream_attempt(adapter, request, per_call).await
        } else {
            self.send_attempt(adapter, request, per_call).await
        }
    }

    async fn send_attempt(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        request: ModelRequest,
        per_call: Duration,
    ) -> std::result::Result<ModelResponse, CallFailure> {
        let limit = per_call.min(self.state.remaining());
        tokio::select! {
            biased;
            _ = self.state.cancel.cancelled() => Err(CallFailure::turn(OrchestratorError::Cancelled)),
            outcome = timeout(limit, adapter.send(request)) => match outcome {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(err)) => Err(CallFailure::Provider(err)),
                Err(_) => Err(self.timed_out(per_call)),
            },
        }
    }

    /// Streamed call; the timeout bounds the wait for each item, not the whole stream.
    async fn stream_attempt(
        &mut self,
        adapter: Arc<dyn ProviderAdapter>,
        request: ModelRequest,
        per_call: Duration,
    ) -> std::result::Result<ModelResponse, CallFailure> {
        let cancel = self.state.cancel.clone();
        let limit = per_call.min(self.state.remaining());
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CallFailure::turn(OrchestratorError::Cancelled)),
            opened = timeout(limit, adapter.stream(request)) => opened,
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(CallFailure::Provider(err)),
            Err(_) => return Err(self.timed_out(per_call)),
        };

        let mut response = ModelResponse::default();
        let mut finish = None;
        let mut emitted = false;
        loop {
            let limit = per_call.min(self.state.remaining());
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(CallFailure::turn(OrchestratorError::Cancelled).with_partial(&response, emitted))
                }
                next = timeout(limit, stream.next()) => next,
            };
            let item = match next {
                Ok(item) => item,
                Err(_) => return Err(self.timed_out(per_call).with_partial(&response, emitted)),
            };
            match item {
                None => break,
                Some(Ok(delta)) => {
                    if let ModelDelta::Text(text) = &delta {
                        if !text.is_empty() {
                            emitted = true;
                            self.state.partial_text.push_str(text);
                            self.emitter.delta(text).await;
                        }
                    }
                    apply_delta(&mut response, &mut finish, delta);
                }
                Some(Err(err)) => {
                    return Err(CallFailure::Provider(err).with_partial(&response, emitted))
                }
            }
        }
        response.finish_reason = finish.unwrap_or(if response.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });
        Ok(response)
    }

    fn timed_out(&self, per_call: Duration) -> CallFailure {
        if self.state.past_deadline() {
            CallFailure::turn(OrchestratorError::TurnTimeout {
                budget: self.state.budget,
            })
        } else {
            CallFailure::Provider(ProviderError::timeout(format!(
                "no response within {}ms",
                per_call.as_millis()
            )))
        }
    }
}

/// Rough prompt size used for quota admission: four characters per token.
pub(crate) fn estimate_tokens(messages: &[Message]) -> u64 {
    let chars: usize = messages
        .iter()
        .map(|m| m.content.chars().count() + tool_call_chars(&m.tool_calls))
        .sum();
    (chars as u64).div_ceil(4)
}

fn tool_call_chars(calls: &[ToolCall]) -> usize {
    calls
        .iter()
        .map(|c| c.name.len() + c.arguments.to_string().len())
        .sum()
}

/// The original driver: a plain loop over rounds.
pub(crate) async fn run_legacy(engine: &mut Engine<'_>) -> Result<()> {
    engine.admit().await?;
    loop {
        engine.begin_round()?;
        let span = info_span!("round", round = engine.state.round);
        let finished = async {
            let response = engine.call_model().await?;
            match engine.classify(response)? {
                Step::Tools(response) => {
                    engine.dispatch_tools(response).await?;
                    Ok::<bool, OrchestratorError>(false)
                }
                Step::Finish(response) => {
                    engine.finish(response).await?;
                    Ok(true)
                }
            }
        }
        .instrument(span)
        .await?;
        if finished {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_estimate_counts_text_and_tool_calls() {
        let msgs = vec![
            Message::user("abcdefgh"),
            Message::assistant_with_tools(
                "",
                vec![ToolCall::pending("c1", "echo", json!({"t": "x"}))],
            ),
        ];
        // 8 chars + "echo" + {"t":"x"}
        assert_eq!(estimate_tokens(&msgs), (8 + 4 + 9_u64).div_ceil(4));
        assert_eq!(estimate_tokens(&[]), 0);
    }
}
