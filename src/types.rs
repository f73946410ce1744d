//! Conversation data model shared by every component.

use std::ops::{Add, AddAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Authenticated caller on whose behalf a turn runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    /// Quota class (e.g. `free`, `pro`); unknown classes fall back to the default class.
    pub class: String,
}

impl Principal {
    pub fn new(id: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class: class.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

/// A tool invocation proposed by the model, resolved in place once executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    #[serde(default)]
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCall {
    pub fn pending(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            status: ToolCallStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn succeed(&mut self, result: Value) {
        self.status = ToolCallStatus::Succeeded;
        self.result = Some(result);
        self.error = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = ToolCallStatus::Failed;
        self.result = None;
        self.error = Some(error.into());
    }

    /// Content of the tool message fed back to the model.
    pub fn result_content(&self) -> String {
        let payload = match self.status {
            ToolCallStatus::Succeeded => serde_json::json!({
                "ok": true,
                "result": self.result.clone().unwrap_or(Value::Null),
            }),
            ToolCallStatus::Failed => serde_json::json!({
                "ok": false,
                "error": self.error.clone().unwrap_or_default(),
            }),
            ToolCallStatus::Pending => serde_json::json!({
                "ok": false,
                "error": "tool call was not executed",
            }),
        };
        payload.to_string()
    }
}

/// Token accounting for one provider call or a whole turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Build usage from vendor counts, deriving the total when the vendor omitted it.
    pub fn new(prompt_tokens: u64, completion_tokens: u64, total_tokens: u64) -> Self {
        let total_tokens = if total_tokens == 0 {
            prompt_tokens + completion_tokens
        } else {
            total_tokens
        };
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    ToolCalls,
    Length,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool_calls",
            Self::Length => "length",
            Self::Error => "error",
        }
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Set on assistant text persisted from an interrupted stream.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            provider: None,
            model: None,
            usage: None,
            partial: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.tool_calls = tool_calls;
        msg
    }

    /// Tool-result message answering `call`.
    pub fn tool_result(call: &ToolCall) -> Self {
        let mut msg = Self::with_role(Role::Tool, call.result_content());
        msg.tool_call_id = Some(call.id.clone());
        msg.tool_name = Some(call.name.clone());
        msg
    }

    pub fn produced_by(mut self, provider: &str, model: &str, usage: Usage) -> Self {
        self.provider = Some(provider.to_string());
        self.model = Some(model.to_string());
        self.usage = Some(usage);
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Conversation record kept by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub skill_name: Option<String>,
    /// Rolling summary of messages that fell out of the history window.
    pub summary: Option<String>,
    /// Messages folded into `summary`; equal to the sequence number of the
    /// last summarized message.
    #[serde(default)]
    pub summarized_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derive a conversation title from its first user message.
pub fn title_from(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return "New conversation".to_string();
    }
    trimmed.chars().take(30).collect()
}

pub(crate) fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_derives_missing_total() {
        assert_eq!(Usage::new(3, 4, 0).total_tokens, 7);
        assert_eq!(Usage::new(3, 4, 9).total_tokens, 9);
        let mut u = Usage::new(1, 1, 2);
        u += Usage::new(2, 3, 5);
        assert_eq!(u, Usage::new(3, 4, 7));
    }

    #[test]
    fn tool_result_content_is_ok_envelope() {
        let mut call = ToolCall::pending("c1", "echo", serde_json::json!({"text": "hi"}));
        call.succeed(serde_json::json!({"text": "hi"}));
        let msg = Message::tool_result(&call);
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("c1"));
        let v: Value = serde_json::from_str(&msg.content).unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(v["result"]["text"], "hi");

        call.fail("boom");
        let v: Value = serde_json::from_str(&call.result_content()).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"], "boom");
    }

    #[test]
    fn finish_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(FinishReason::ToolCalls).unwrap(),
            serde_json::json!("tool_calls")
        );
    }

    #[test]
    fn title_truncates_to_thirty_chars() {
        let t = title_from("  a very long first message that keeps going on  ");
        assert_eq!(t.chars().count(), 30);
        assert_eq!(title_from("   "), "New conversation");
    }
}
