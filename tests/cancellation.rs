//! Cancellation and the wall-clock budget.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::BoxError;
use tower_turns::{
    tool_fn, CancellationToken, ModelResponse, Orchestrator, OrchestratorError, Role, ScriptStep,
    ScriptedProvider, ToolCall, TurnEvent, TurnRequest, Usage,
};

#[tokio::test(start_paused = true)]
async fn cancel_after_first_delta_keeps_partial_text() {
    let h = harness(
        config().build(),
        ScriptedProvider::new("primary")
            .then_text("one two three four")
            .with_delta_delay(Duration::from_millis(100)),
        ScriptedProvider::new("backup"),
    );
    let mut stream = h.orchestrator.stream_turn(TurnRequest::new(alice(), "count"));
    let mut events = vec![stream.next().await.unwrap(), stream.next().await.unwrap()];
    assert_eq!(names(&events), vec!["meta", "delta"]);
    stream.cancel();
    while let Some(event) = stream.next().await {
        events.push(event);
    }

    assert_protocol(&events);
    assert_eq!(names(&events), vec!["meta", "delta", "error"]);
    assert_eq!(error_kind(&events).as_deref(), Some("CancellationError"));

    let stored = h
        .orchestrator
        .messages("alice", &conversation_of(&events), None)
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].message.content, "one ");
    assert!(stored[1].message.partial);
    assert_eq!(h.backup.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_stream_is_charged_an_estimate() {
    let config = config()
        .quota_enabled(true)
        .quota_class("default", limits(None, Some(10_000)))
        .build();
    let h = harness(
        config,
        ScriptedProvider::new("primary")
            .then_text("one two three four")
            .with_delta_delay(Duration::from_millis(100)),
        ScriptedProvider::new("backup"),
    );
    let mut stream = h.orchestrator.stream_turn(TurnRequest::new(alice(), "count"));
    let _meta = stream.next().await.unwrap();
    let _first = stream.next().await.unwrap();
    stream.cancel();
    while stream.next().await.is_some() {}

    // the vendor never reported usage, so the prompt and "one " are estimated
    let usage = h.orchestrator.metrics_recent("alice", 1)[0].usage;
    assert_eq!(usage.completion_tokens, 1);
    assert!(usage.prompt_tokens > 0);
    assert_eq!(usage.total_tokens, usage.prompt_tokens + 1);
    let primary = h.orchestrator.quota_snapshot(&alice(), "primary", "p-1");
    assert_eq!(primary.windows[0].used_tokens, usage.total_tokens);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_blocking_turn() {
    let h = harness(
        config().build(),
        ScriptedProvider::new("primary").then(ScriptStep::Hang),
        ScriptedProvider::new("backup"),
    );
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });
    let err = h
        .orchestrator
        .run_turn_with_cancel(TurnRequest::new(alice(), "hello"), token)
        .await
        .unwrap_err();
    assert!(err.is_cancellation());

    let recent = h.orchestrator.metrics_recent("alice", 1);
    assert!(!recent[0].success);
    assert!(!recent[0].is_stream);
    let stored = h
        .orchestrator
        .messages("alice", recent[0].conversation_id.as_deref().unwrap(), None)
        .await
        .unwrap();
    // no text was produced, so nothing partial is kept
    assert_eq!(stored.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_tool_dispatch_skips_the_tool_group() {
    let slow = tool_fn(
        "slow",
        "Sleeps for ten seconds",
        json!({"type": "object", "properties": {}}),
        |_args: Value| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<Value, BoxError>(json!("late"))
        },
    );
    let mut proposal = ModelResponse::tool_calls(
        vec![ToolCall::pending("call_1", "slow", json!({}))],
        Usage::new(10, 5, 15),
    );
    proposal.content = "Let me check.".into();
    let primary = Arc::new(ScriptedProvider::new("primary").then(ScriptStep::Respond(proposal)));
    let orchestrator = Orchestrator::builder(config().build())
        .provider(primary)
        .tool(slow)
        .build()
        .unwrap();

    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
    });
    let err = orchestrator
        .run_turn_with_cancel(TurnRequest::new(alice(), "check"), token)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled));

    let recent = orchestrator.metrics_recent("alice", 1);
    let stored = orchestrator
        .messages("alice", recent[0].conversation_id.as_deref().unwrap(), None)
        .await
        .unwrap();
    let kept: Vec<(Role, &str, bool, usize)> = stored
        .iter()
        .map(|m| {
            (
                m.message.role,
                m.message.content.as_str(),
                m.message.partial,
                m.message.tool_calls.len(),
            )
        })
        .collect();
    assert_eq!(
        kept,
        vec![
            (Role::User, "check", false, 0),
            (Role::Assistant, "Let me check.", true, 0),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn wall_clock_budget_bounds_the_turn() {
    let h = harness(
        config().wall_clock_budget(Duration::from_secs(1)).build(),
        ScriptedProvider::new("primary").then(ScriptStep::Hang),
        ScriptedProvider::new("backup").then_text("never"),
    );
    let started = tokio::time::Instant::now();
    let events = collect(h.orchestrator.stream_turn(TurnRequest::new(alice(), "hello"))).await;
    assert_protocol(&events);
    assert_eq!(error_kind(&events).as_deref(), Some("TurnTimeoutError"));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.backup.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_tools_hit_the_budget_too() {
    let slow = tool_fn(
        "slow",
        "Sleeps for a minute",
        json!({"type": "object", "properties": {}}),
        |_args: Value| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<Value, BoxError>(json!("late"))
        },
    );
    let primary = Arc::new(
        ScriptedProvider::new("primary")
            .then_tool_calls(vec![ToolCall::pending("call_1", "slow", json!({}))]),
    );
    let config = config()
        .wall_clock_budget(Duration::from_secs(2))
        .tool_timeout(Duration::from_secs(120))
        .build();
    let orchestrator = Orchestrator::builder(config)
        .provider(primary)
        .tool(slow)
        .build()
        .unwrap();
    let err = orchestrator
        .run_turn(TurnRequest::new(alice(), "wait"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "TurnTimeoutError");
    match orchestrator.metrics_recent("alice", 1).first() {
        Some(metric) => assert_eq!(metric.error_kind.as_deref(), Some("TurnTimeoutError")),
        None => panic!("turn was not recorded"),
    }
}

#[tokio::test]
async fn terminal_error_event_carries_the_message() {
    let h = harness(
        config().build(),
        ScriptedProvider::new("primary"),
        ScriptedProvider::new("backup"),
    );
    let events = collect(h.orchestrator.stream_turn(TurnRequest::new(alice(), "  "))).await;
    assert_protocol(&events);
    match events.last() {
        Some(TurnEvent::Error { kind, message }) => {
            assert_eq!(kind, "ConfigError");
            assert!(!message.is_empty());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.primary.calls(), 0);
}
