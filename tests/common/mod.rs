//! Shared fixtures: two scripted providers, `primary` and `backup`, with
//! `primary` falling back to `backup`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tower_turns::config::{ProviderKind, ProviderSettings, QuotaRule};
use tower_turns::{
    ConfigBuilder, Orchestrator, OrchestratorConfig, Principal, ScriptedProvider, ToolCall,
    TurnEvent, TurnStream,
};

pub fn settings(model: &str) -> ProviderSettings {
    ProviderSettings {
        kind: ProviderKind::OpenAiCompatible,
        base_url: None,
        api_key_env: None,
        api_key: None,
        default_model: model.to_string(),
        models: vec![model.to_string()],
        timeout_secs: None,
    }
}

/// `primary/p-1` with `backup/b-1` as its only fallback, one attempt per
/// candidate, quotas off.
pub fn config() -> ConfigBuilder {
    ConfigBuilder::new()
        .provider("primary", settings("p-1"))
        .provider("backup", settings("b-1"))
        .default_provider("primary", "p-1")
        .fallback_chain("primary", vec!["backup".into()])
        .retry(1, Duration::from_millis(10))
        .quota_enabled(false)
}

pub fn limits(max_requests: Option<u64>, max_tokens: Option<u64>) -> Vec<QuotaRule> {
    vec![QuotaRule {
        window_secs: 60,
        max_requests,
        max_tokens,
    }]
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub primary: Arc<ScriptedProvider>,
    pub backup: Arc<ScriptedProvider>,
}

pub fn harness(config: OrchestratorConfig, primary: ScriptedProvider, backup: ScriptedProvider) -> Harness {
    let primary = Arc::new(primary);
    let backup = Arc::new(backup);
    let orchestrator = Orchestrator::builder(config)
        .provider(primary.clone())
        .provider(backup.clone())
        .build()
        .expect("orchestrator builds");
    Harness {
        orchestrator,
        primary,
        backup,
    }
}

pub fn alice() -> Principal {
    Principal::new("alice", "default")
}

pub fn echo_call(id: &str, text: &str) -> ToolCall {
    ToolCall::pending(id, "echo", json!({ "text": text }))
}

pub async fn collect(stream: TurnStream) -> Vec<TurnEvent> {
    stream.collect().await
}

pub fn names(events: &[TurnEvent]) -> Vec<&'static str> {
    events.iter().map(TurnEvent::event_name).collect()
}

pub fn delta_text(events: &[TurnEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::Delta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

pub fn conversation_of(events: &[TurnEvent]) -> String {
    match events.first() {
        Some(TurnEvent::Meta {
            conversation_id, ..
        }) => conversation_id.clone(),
        other => panic!("expected meta first, got {other:?}"),
    }
}

/// Kind of the terminal error event.
pub fn error_kind(events: &[TurnEvent]) -> Option<String> {
    match events.last() {
        Some(TurnEvent::Error { kind, .. }) => Some(kind.clone()),
        _ => None,
    }
}

/// Every stream: `meta` first, exactly one terminal event, and it is last.
pub fn assert_protocol(events: &[TurnEvent]) {
    assert_eq!(events.first().map(TurnEvent::event_name), Some("meta"));
    assert_eq!(
        events.iter().filter(|e| e.event_name() == "meta").count(),
        1,
        "meta must be sent once"
    );
    assert_eq!(
        events.iter().filter(|e| e.is_terminal()).count(),
        1,
        "exactly one terminal event"
    );
    assert!(events.last().is_some_and(TurnEvent::is_terminal));
}
