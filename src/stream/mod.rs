//! Turn event stream
//!
//! What this module provides
//! - `TurnEvent`: the four client-facing events (`meta`, `delta`, `done`, `error`),
//!   serializable as JSON tagged by `event` or as SSE frames
//! - `StreamEmitter`: the single writer of a turn's events, which enforces their order
//!
//! Ordering enforced by the emitter
//! - `meta` exactly once and first; an `error` before `meta` sends `meta` first
//! - `delta` only between `meta` and the terminal event, never empty
//! - exactly one of `done` / `error`, after which everything is dropped
//!
//! A dropped receiver cancels the turn's token, so the engine stops at its
//! next checkpoint instead of producing output nobody reads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{FinishReason, Usage};

/// Which candidates a turn went through before the one that answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackInfo {
    /// `provider/model` the turn started on.
    pub from: String,
    /// Every candidate tried, in order, ending with the one that answered.
    pub chain: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TurnEvent {
    Meta {
        conversation_id: String,
        provider: String,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    Delta {
        text: String,
    },
    Done {
        content: String,
        usage: Usage,
        finish_reason: FinishReason,
        provider: String,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<FallbackInfo>,
    },
    Error {
        message: String,
        kind: String,
    },
}

impl TurnEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Meta { .. } => "meta",
            Self::Delta { .. } => "delta",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Payload without the `event` tag.
    pub fn data(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("event");
        }
        value
    }

    /// Render as one server-sent-events frame.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event_name(), self.data())
    }
}

#[derive(Debug, Clone, Default)]
struct Identity {
    conversation_id: String,
    provider: String,
    model: String,
}

/// Writes one turn's events in protocol order.
#[derive(Debug)]
pub struct StreamEmitter {
    tx: Option<mpsc::Sender<TurnEvent>>,
    cancel: Option<CancellationToken>,
    identity: Identity,
    meta_sent: bool,
    finished: bool,
    closed: bool,
}

impl StreamEmitter {
    pub fn new(tx: mpsc::Sender<TurnEvent>, cancel: CancellationToken) -> Self {
        Self {
            tx: Some(tx),
            cancel: Some(cancel),
            identity: Identity::default(),
            meta_sent: false,
            finished: false,
            closed: false,
        }
    }

    /// An emitter that drops every event; used by non-streaming turns.
    pub fn detached() -> Self {
        Self {
            tx: None,
            cancel: None,
            identity: Identity::default(),
            meta_sent: false,
            finished: false,
            closed: false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.tx.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Identity used if the turn fails before `meta` went out.
    pub fn set_identity(&mut self, conversation_id: &str, provider: &str, model: &str) {
        self.identity = Identity {
            conversation_id: conversation_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
        };
    }

    pub async fn meta(&mut self, warning: Option<String>) {
        if self.meta_sent || self.finished {
            return;
        }
        self.meta_sent = true;
        let event = TurnEvent::Meta {
            conversation_id: self.identity.conversation_id.clone(),
            provider: self.identity.provider.clone(),
            model: self.identity.model.clone(),
            warning,
        };
        self.send(event).await;
    }

    pub async fn delta(&mut self, text: &str) {
        if text.is_empty() || self.finished {
            return;
        }
        if !self.meta_sent {
            self.meta(None).await;
        }
        self.send(TurnEvent::Delta {
            text: text.to_string(),
        })
        .await;
    }

    pub async fn done(
        &mut self,
        content: String,
        usage: Usage,
        finish_reason: FinishReason,
        provider: String,
        model: String,
        fallback: Option<FallbackInfo>,
    ) {
        if self.finished {
            return;
        }
        if !self.meta_sent {
            self.meta(None).await;
        }
        self.finished = true;
        self.send(TurnEvent::Done {
            content,
            usage,
            finish_reason,
            provider,
            model,
            fallback,
        })
        .await;
    }

    pub async fn error(&mut self, message: String, kind: &str) {
        if self.finished {
            return;
        }
        if !self.meta_sent {
            self.meta(None).await;
        }
        self.finished = true;
        self.send(TurnEvent::Error {
            message,
            kind: kind.to_string(),
        })
        .await;
    }

    async fn send(&mut self, event: TurnEvent) {
        if self.closed {
            return;
        }
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(event).await.is_err() {
            debug!("event receiver dropped; cancelling turn");
            self.closed = true;
            if let Some(cancel) = &self.cancel {
                cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn emitter(cap: usize) -> (StreamEmitter, mpsc::Receiver<TurnEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(cap);
        let handle = CancellationToken::new();
        let mut e = StreamEmitter::new(tx, handle.clone());
        e.set_identity("conv_1", "openai", "gpt-4o");
        (e, rx, handle)
    }

    async fn drain(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn enforces_meta_first_and_single_terminal() {
        let (mut e, rx, _) = emitter(16);
        e.delta("Hel").await;
        e.meta(Some("ignored".into())).await;
        e.delta("").await;
        e.delta("lo").await;
        e.done(
            "Hello".into(),
            Usage::new(1, 2, 3),
            FinishReason::Stop,
            "openai".into(),
            "gpt-4o".into(),
            None,
        )
        .await;
        e.error("late".into(), "InternalError").await;
        e.delta("late").await;
        drop(e);

        let names: Vec<_> = drain(rx).await.iter().map(|ev| ev.event_name()).collect();
        assert_eq!(names, vec!["meta", "delta", "delta", "done"]);
    }

    #[tokio::test]
    async fn error_before_meta_sends_meta_first() {
        let (mut e, rx, _) = emitter(4);
        e.error("quota exceeded".into(), "QuotaExceededError").await;
        drop(e);
        let events = drain(rx).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], TurnEvent::Meta { conversation_id, .. } if conversation_id == "conv_1"));
        assert_eq!(
            events[1],
            TurnEvent::Error {
                message: "quota exceeded".into(),
                kind: "QuotaExceededError".into()
            }
        );
    }

    #[tokio::test]
    async fn dropped_receiver_cancels() {
        let (mut e, rx, handle) = emitter(1);
        drop(rx);
        e.meta(None).await;
        assert!(handle.is_cancelled());
    }

    #[test]
    fn json_and_sse_shapes() {
        let ev = TurnEvent::Delta { text: "hi".into() };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            serde_json::json!({"event": "delta", "text": "hi"})
        );
        assert_eq!(ev.to_sse(), "event: delta\ndata: {\"text\":\"hi\"}\n\n");

        let done = TurnEvent::Done {
            content: "x".into(),
            usage: Usage::new(1, 1, 2),
            finish_reason: FinishReason::Stop,
            provider: "deepseek".into(),
            model: "deepseek-chat".into(),
            fallback: Some(FallbackInfo {
                from: "openai/gpt-4o".into(),
                chain: vec!["openai/gpt-4o".into(), "deepseek/deepseek-chat".into()],
            }),
        };
        let data = done.data();
        assert_eq!(data["usage"]["total_tokens"], 2);
        assert_eq!(data["finish_reason"], "stop");
        assert_eq!(data["fallback"]["from"], "openai/gpt-4o");
        let back: TurnEvent = serde_json::from_value(serde_json::to_value(&done).unwrap()).unwrap();
        assert_eq!(back, done);
    }
}
