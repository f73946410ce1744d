//! Error types for the orchestration core

use std::time::Duration;

use thiserror::Error;

use crate::provider::ProviderError;
use crate::store::StoreError;
use crate::tools::ToolError;

/// Result type alias for the orchestration core
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Terminal error of a conversation turn.
///
/// Only the provider boundary recovers locally (through failover); every other
/// variant ends the turn and is surfaced once to the caller, as an `error`
/// event when streaming.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Arguments proposed by the model do not match the tool's schema
    #[error("invalid arguments for tool `{tool}`: {reason}")]
    ToolArgument { tool: String, reason: String },

    /// A tool executor failed outside of the model-visible result path
    #[error("tool `{tool}` failed: {reason}")]
    ToolExecution { tool: String, reason: String },

    /// Provider failure that could have been retried
    #[error("provider {provider}/{model} failed transiently: {message}")]
    ProviderTransient {
        provider: String,
        model: String,
        message: String,
    },

    /// Provider failure that retrying will not fix
    #[error("provider {provider}/{model} failed: {message}")]
    ProviderFatal {
        provider: String,
        model: String,
        message: String,
    },

    /// Every candidate of the failover chain failed
    #[error("all provider candidates failed ({}): {last_error}", chain.join(" -> "))]
    ProviderExhausted {
        chain: Vec<String>,
        last_error: String,
    },

    #[error("quota exceeded: {reason}")]
    QuotaExceeded { reason: String },

    #[error("run exceeded the maximum of {max_rounds} rounds")]
    RunIterationLimit { max_rounds: u32 },

    #[error("turn cancelled")]
    Cancelled,

    #[error("turn exceeded its wall-clock budget of {}ms", budget.as_millis())]
    TurnTimeout { budget: Duration },

    /// Another turn currently owns the conversation
    #[error("conversation {0} already has an active turn")]
    ConversationBusy(String),

    #[error("conversation {0} not found")]
    ConversationNotFound(String),

    #[error("skill {0} not found")]
    SkillNotFound(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Stable error kind reported in `error` events and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolArgument { .. } => "ToolArgumentError",
            Self::ToolExecution { .. } => "ToolExecutionError",
            Self::ProviderTransient { .. } => "ProviderTransientError",
            Self::ProviderFatal { .. } => "ProviderFatalError",
            Self::ProviderExhausted { .. } => "ProviderExhaustedError",
            Self::QuotaExceeded { .. } => "QuotaExceededError",
            Self::RunIterationLimit { .. } => "RunIterationLimitError",
            Self::Cancelled => "CancellationError",
            Self::TurnTimeout { .. } => "TurnTimeoutError",
            Self::ConversationBusy(_) => "ConversationBusyError",
            Self::ConversationNotFound(_) | Self::SkillNotFound(_) => "NotFoundError",
            Self::UnknownTool(_) => "ToolNotFoundError",
            Self::Config(_) => "ConfigError",
            Self::Store(_) => "StoreError",
            Self::Serialization(_) | Self::Io(_) | Self::Internal(_) => "InternalError",
        }
    }

    /// Whether the turn ended because the caller asked it to.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Lift a provider error into the turn taxonomy, keeping its transient/fatal split.
    pub fn from_provider(provider: &str, model: &str, err: &ProviderError) -> Self {
        if err.is_transient() {
            Self::ProviderTransient {
                provider: provider.to_string(),
                model: model.to_string(),
                message: err.to_string(),
            }
        } else {
            Self::ProviderFatal {
                provider: provider.to_string(),
                model: model.to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<ToolError> for OrchestratorError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::InvalidArguments { tool, reason } => Self::ToolArgument { tool, reason },
            ToolError::Unknown(name) => Self::UnknownTool(name),
            ToolError::Cancelled => Self::Cancelled,
            ToolError::Duplicate(name) => Self::Config(format!("tool {name} registered twice")),
            other => {
                let tool = other.tool_name().unwrap_or_default().to_string();
                Self::ToolExecution {
                    tool,
                    reason: other.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderErrorKind;

    #[test]
    fn display_and_kind() {
        let err = OrchestratorError::RunIterationLimit { max_rounds: 4 };
        assert_eq!(err.to_string(), "run exceeded the maximum of 4 rounds");
        assert_eq!(err.kind(), "RunIterationLimitError");

        let err = OrchestratorError::ProviderExhausted {
            chain: vec!["openai/gpt-4o".into(), "deepseek/deepseek-chat".into()],
            last_error: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "all provider candidates failed (openai/gpt-4o -> deepseek/deepseek-chat): boom"
        );
        assert_eq!(OrchestratorError::Cancelled.kind(), "CancellationError");
    }

    #[test]
    fn provider_errors_keep_their_class() {
        let transient = ProviderError::new(ProviderErrorKind::RateLimited, "slow down");
        let fatal = ProviderError::new(ProviderErrorKind::Auth, "bad key");
        assert_eq!(
            OrchestratorError::from_provider("openai", "gpt-4o", &transient).kind(),
            "ProviderTransientError"
        );
        assert_eq!(
            OrchestratorError::from_provider("openai", "gpt-4o", &fatal).kind(),
            "ProviderFatalError"
        );
    }

    #[test]
    fn tool_argument_errors_map_to_argument_kind() {
        let err: OrchestratorError = ToolError::InvalidArguments {
            tool: "calculate".into(),
            reason: "missing field `expression`".into(),
        }
        .into();
        assert!(matches!(err, OrchestratorError::ToolArgument { .. }));
        assert_eq!(err.kind(), "ToolArgumentError");
    }
}
