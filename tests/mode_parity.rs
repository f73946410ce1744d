//! The graph driver and the legacy loop run the same turn the same way.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use tower_turns::{
    OrchestratorMode, ProviderError, ProviderErrorKind, Role, ScriptedProvider, TurnEvent,
    TurnRequest,
};

fn script() -> (ScriptedProvider, ScriptedProvider) {
    (
        ScriptedProvider::new("primary")
            .then_tool_calls(vec![echo_call("call_1", "ping")])
            .then_fail(ProviderError::new(ProviderErrorKind::Server, "blip")),
        ScriptedProvider::new("backup").then_text("pong received"),
    )
}

struct Run {
    events: Vec<TurnEvent>,
    roles: Vec<Role>,
    calls: (usize, usize),
}

async fn run(mode: OrchestratorMode) -> Run {
    let (primary, backup) = script();
    let h = harness(config().mode(mode).build(), primary, backup);
    let events = collect(h.orchestrator.stream_turn(TurnRequest::new(alice(), "ping please"))).await;
    let stored = h
        .orchestrator
        .messages("alice", &conversation_of(&events), None)
        .await
        .unwrap();
    Run {
        roles: stored.iter().map(|m| m.message.role).collect(),
        calls: (h.primary.calls(), h.backup.calls()),
        events,
    }
}

/// Events with the generated conversation id blanked out.
fn normalized(events: &[TurnEvent]) -> Vec<TurnEvent> {
    events
        .iter()
        .cloned()
        .map(|event| match event {
            TurnEvent::Meta {
                provider,
                model,
                warning,
                ..
            } => TurnEvent::Meta {
                conversation_id: String::new(),
                provider,
                model,
                warning,
            },
            other => other,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn tool_round_then_failover_matches() {
    let legacy = run(OrchestratorMode::Legacy).await;
    let graph = run(OrchestratorMode::Graph).await;

    assert_protocol(&legacy.events);
    assert_eq!(normalized(&legacy.events), normalized(&graph.events));
    assert_eq!(legacy.roles, graph.roles);
    assert_eq!(
        legacy.roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(legacy.calls, graph.calls);
    assert_eq!(legacy.calls, (2, 1));
}

#[tokio::test]
async fn round_limit_matches() {
    for mode in [OrchestratorMode::Legacy, OrchestratorMode::Graph] {
        let h = harness(
            config().mode(mode).max_rounds(1).build(),
            ScriptedProvider::new("primary").then_tool_calls(vec![echo_call("c1", "x")]),
            ScriptedProvider::new("backup"),
        );
        let err = h
            .orchestrator
            .run_turn(TurnRequest::new(alice(), "loop"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "RunIterationLimitError", "{mode:?}");
        assert_eq!(h.orchestrator.mode(), mode);
    }
}
