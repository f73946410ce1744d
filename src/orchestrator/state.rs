//! Per-turn state owned by the turn engine.

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};
use crate::failover::FailoverPlan;
use crate::provider::{ModelParams, ToolSpec};
use crate::stream::FallbackInfo;
use crate::types::{FinishReason, Message, Principal, ToolCall, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// `PENDING → RUNNING → {RUNNING | COMPLETED | FAILED | CANCELLED}`; a
    /// pending run may also fail or be cancelled before its first round.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// Transient state of one in-flight turn, passed explicitly through the round loop.
#[derive(Debug)]
pub struct AgentRunState {
    pub run_id: String,
    pub conversation_id: String,
    pub principal: Principal,
    status: RunStatus,
    pub round: u32,
    pub max_rounds: u32,
    pub usage: Usage,
    pub plan: FailoverPlan,
    /// Candidate that served the last successful call.
    pub provider: String,
    pub model: String,
    /// Provider context: everything the next call sends.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub offered: HashSet<String>,
    pub params: ModelParams,
    pub tool_runs: Vec<ToolCall>,
    pub cancel: CancellationToken,
    pub deadline: Instant,
    pub budget: Duration,
    pub streaming: bool,
    /// Candidates admitted by the quota limiter during this turn.
    pub admitted: HashSet<String>,
    /// Text streamed during the current round, kept for partial persistence.
    pub partial_text: String,
    pub content: String,
    pub finish_reason: FinishReason,
}

impl AgentRunState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: String,
        conversation_id: String,
        principal: Principal,
        plan: FailoverPlan,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
        params: ModelParams,
        max_rounds: u32,
        cancel: CancellationToken,
        budget: Duration,
        streaming: bool,
    ) -> Self {
        let primary = plan.primary().clone();
        let offered = tools.iter().map(|t| t.name.clone()).collect();
        Self {
            run_id,
            conversation_id,
            principal,
            status: RunStatus::Pending,
            round: 0,
            max_rounds,
            usage: Usage::default(),
            plan,
            provider: primary.provider,
            model: primary.model,
            messages,
            tools,
            offered,
            params,
            tool_runs: Vec::new(),
            cancel,
            deadline: Instant::now() + budget,
            budget,
            streaming,
            admitted: HashSet::new(),
            partial_text: String::new(),
            content: String::new(),
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::Internal(format!(
                "illegal run transition {} -> {}",
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn past_deadline(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn fallback(&self) -> Option<FallbackInfo> {
        self.plan.is_fallback().then(|| FallbackInfo {
            from: self.plan.primary().label(),
            chain: self.plan.chain().to_vec(),
        })
    }
}
