//! Rolling conversation summary
//!
//! What this module provides
//! - `plan_refresh`: decides whether enough messages have aged past the
//!   recent window to fold them into the summary
//! - `summary_prompt`: the two-message request that merges the existing
//!   summary with the aged messages
//! - `unsummarized`: the history left for the provider context once a
//!   summary covers the older part
//!
//! Implementation strategy
//! - `Conversation::summarized_count` records how far the summary reaches;
//!   sequence numbers start at 1, so it is also the sequence number of the
//!   last summarized message
//! - The recent window is never summarized, and a tool group is folded in
//!   whole or not at all

use crate::config::MemoryConfig;
use crate::store::StoredMessage;
use crate::types::{Message, Role};

/// At most this many messages are rendered into one summary request.
const MAX_TRANSCRIPT_MESSAGES: usize = 80;
/// Longest rendering of a single message in the transcript.
const MAX_LINE_CHARS: usize = 1_000;

const SYSTEM_PROMPT: &str = "You compress conversations into reusable, structured long-term \
memory. Output only the summary, without commentary.";

const INSTRUCTIONS: &str = "Requirements:\n\
1) keep user preferences, constraints and agreed terminology\n\
2) keep settled facts and open tasks\n\
3) drop small talk\n\
4) structure the output as: Preferences, Facts, Open tasks, Risks";

/// Messages to fold into the summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryPlan<'a> {
    pub rows: &'a [StoredMessage],
    /// New `summarized_count` once the summary covers `rows`.
    pub through: u64,
}

/// Plan a refresh over `history` (oldest first), or `None` when it is not due.
pub fn plan_refresh<'a>(
    config: &MemoryConfig,
    history: &'a [StoredMessage],
    summarized_count: u64,
) -> Option<SummaryPlan<'a>> {
    if !config.enabled || history.is_empty() {
        return None;
    }
    let mut cutoff = history.len().saturating_sub(config.keep_recent());
    while cutoff < history.len() && history[cutoff].message.role == Role::Tool {
        cutoff += 1;
    }
    let start = history
        .iter()
        .position(|m| m.seq > summarized_count)
        .unwrap_or(history.len());
    if cutoff <= start || cutoff - start < config.trigger() {
        return None;
    }
    let rows = &history[start..cutoff];
    Some(SummaryPlan {
        rows,
        through: rows.last()?.seq,
    })
}

pub fn summary_prompt(existing: Option<&str>, rows: &[StoredMessage]) -> Vec<Message> {
    let skip = rows.len().saturating_sub(MAX_TRANSCRIPT_MESSAGES);
    let transcript = rows[skip..]
        .iter()
        .filter_map(|row| transcript_line(&row.message))
        .collect::<Vec<_>>()
        .join("\n");
    let user = match existing.map(str::trim).filter(|s| !s.is_empty()) {
        Some(summary) => format!(
            "Merge the existing summary and the new messages into one updated memory.\n\
             {INSTRUCTIONS}\n\nExisting summary:\n{summary}\n\nNew messages:\n{transcript}"
        ),
        None => format!(
            "Summarize the conversation below into long-term memory.\n\
             {INSTRUCTIONS}\n\nConversation:\n{transcript}"
        ),
    };
    vec![Message::system(SYSTEM_PROMPT), Message::user(user)]
}

fn transcript_line(message: &Message) -> Option<String> {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut content = message.content.trim().to_string();
    if content.is_empty() && message.has_tool_calls() {
        let names: Vec<&str> = message.tool_calls.iter().map(|c| c.name.as_str()).collect();
        content = format!("(called {})", names.join(", "));
    }
    if content.is_empty() {
        return None;
    }
    Some(format!("{role}: {}", clip(&content, MAX_LINE_CHARS)))
}

/// Trimmed model output cut to `max_chars`, or `None` when empty.
pub fn clean_summary(text: &str, max_chars: usize) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| clip(text, max_chars))
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Messages the summary does not cover yet.
pub fn unsummarized(history: Vec<StoredMessage>, summarized_count: u64) -> Vec<Message> {
    history
        .into_iter()
        .filter(|m| m.seq > summarized_count)
        .map(|m| m.message)
        .collect()
}
