//! Provider context assembly and tool-call pairing checks.
//!
//! What this module provides
//! - `build_context`: system prompt, rolling summary, retrieved context, the
//!   trimmed history window and the new user message, in that order
//! - `trim_history`: keep the most recent messages without starting the window
//!   on tool results whose assistant message fell out of it
//! - `validate_tool_pairing`: every assistant message with tool calls is
//!   followed by exactly one tool message per call, in call order, before
//!   anything else

use std::collections::HashSet;

use crate::retrieval::RetrievedContext;
use crate::types::{Message, Role};

/// Inputs of one provider context.
#[derive(Debug, Clone, Default)]
pub struct ContextParts {
    pub system_prompt: Option<String>,
    pub summary: Option<String>,
    pub retrieved: Vec<RetrievedContext>,
    pub history: Vec<Message>,
    pub user: Option<Message>,
}

pub fn build_context(parts: ContextParts) -> Vec<Message> {
    let mut messages = Vec::with_capacity(parts.history.len() + 4);
    if let Some(prompt) = parts.system_prompt.filter(|p| !p.trim().is_empty()) {
        messages.push(Message::system(prompt));
    }
    if let Some(summary) = parts.summary.filter(|s| !s.trim().is_empty()) {
        messages.push(Message::system(format!(
            "Summary of earlier conversation:\n{summary}"
        )));
    }
    if !parts.retrieved.is_empty() {
        messages.push(Message::system(render_retrieved(&parts.retrieved)));
    }
    messages.extend(parts.history);
    if let Some(user) = parts.user {
        messages.push(user);
    }
    messages
}

fn render_retrieved(items: &[RetrievedContext]) -> String {
    let mut out = String::from("Relevant context:");
    for (i, item) in items.iter().enumerate() {
        match &item.source {
            Some(source) => out.push_str(&format!("\n[{}] ({source}) {}", i + 1, item.content)),
            None => out.push_str(&format!("\n[{}] {}", i + 1, item.content)),
        }
    }
    out
}

/// Keep at most `max` recent messages, never starting on an orphaned tool result.
pub fn trim_history(mut messages: Vec<Message>, max: usize) -> Vec<Message> {
    if messages.len() > max {
        messages.drain(..messages.len() - max);
    }
    let orphaned = messages
        .iter()
        .take_while(|m| m.role == Role::Tool)
        .count();
    messages.drain(..orphaned);
    // an assistant that asked for tools but has no results in the window
    if let Some(last) = messages.last() {
        if last.role == Role::Assistant && last.has_tool_calls() {
            messages.pop();
        }
    }
    messages
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationCode {
    ToolBeforeAssistant {
        tool_index: usize,
    },
    UnknownToolResponse {
        tool_index: usize,
        tool_call_id: String,
    },
    DuplicateToolResponse {
        tool_call_id: String,
    },
    ToolResponsesOutOfOrder {
        assistant_index: usize,
        expected: Vec<String>,
        observed: Vec<String>,
    },
    MissingToolResponses {
        assistant_index: usize,
        missing_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub code: ViolationCode,
    pub message: String,
}

impl Violation {
    fn new(code: ViolationCode) -> Self {
        let message = match &code {
            ViolationCode::ToolBeforeAssistant { tool_index } => {
                format!("tool message at index {tool_index} does not follow an assistant")
            }
            ViolationCode::UnknownToolResponse {
                tool_index,
                tool_call_id,
            } => format!("tool message at index {tool_index} references unknown id '{tool_call_id}'"),
            ViolationCode::DuplicateToolResponse { tool_call_id } => {
                format!("duplicate tool responses for id '{tool_call_id}'")
            }
            ViolationCode::ToolResponsesOutOfOrder {
                assistant_index,
                expected,
                observed,
            } => format!(
                "tool responses after assistant {assistant_index} out of order (expected {expected:?}, observed {observed:?})"
            ),
            ViolationCode::MissingToolResponses {
                assistant_index,
                missing_ids,
            } => format!(
                "assistant {assistant_index} missing responses for ids: {}",
                missing_ids.join(", ")
            ),
        };
        Self { code, message }
    }
}

/// First pairing violation in `messages`, if any.
pub fn validate_tool_pairing(messages: &[Message]) -> Option<Violation> {
    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        if msg.role == Role::Tool {
            return Some(Violation::new(ViolationCode::ToolBeforeAssistant { tool_index: i }));
        }
        if msg.role != Role::Assistant || !msg.has_tool_calls() {
            i += 1;
            continue;
        }
        let expected: Vec<String> = msg.tool_calls.iter().map(|c| c.id.clone()).collect();
        let known: HashSet<&str> = expected.iter().map(String::as_str).collect();
        let mut observed = Vec::new();
        let mut seen = HashSet::new();
        let mut j = i + 1;
        while j < messages.len() && messages[j].role == Role::Tool {
            let id = messages[j].tool_call_id.clone().unwrap_or_default();
            if !known.contains(id.as_str()) {
                return Some(Violation::new(ViolationCode::UnknownToolResponse {
                    tool_index: j,
                    tool_call_id: id,
                }));
            }
            if !seen.insert(id.clone()) {
                return Some(Violation::new(ViolationCode::DuplicateToolResponse {
                    tool_call_id: id,
                }));
            }
            observed.push(id);
            j += 1;
        }
        if observed.len() < expected.len() {
            let missing_ids = expected
                .iter()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect();
            return Some(Violation::new(ViolationCode::MissingToolResponses {
                assistant_index: i,
                missing_ids,
            }));
        }
        if observed != expected {
            return Some(Violation::new(ViolationCode::ToolResponsesOutOfOrder {
                assistant_index: i,
                expected,
                observed,
            }));
        }
        i = j;
    }
    None
}
