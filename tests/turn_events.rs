//! Event protocol of streaming turns.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use tower_turns::retrieval::{RetrievedContext, StaticRetriever};
use tower_turns::{Orchestrator, Role, ScriptedProvider, TurnEvent, TurnRequest, Usage};

#[tokio::test]
async fn text_turn_streams_meta_deltas_done() {
    let h = harness(
        config().build(),
        ScriptedProvider::new("primary").then_text("Hello streaming world"),
        ScriptedProvider::new("backup"),
    );
    let events = collect(h.orchestrator.stream_turn(TurnRequest::new(alice(), "hi"))).await;

    assert_protocol(&events);
    assert_eq!(names(&events), vec!["meta", "delta", "delta", "delta", "done"]);
    match events.first() {
        Some(TurnEvent::Meta {
            provider,
            model,
            warning,
            ..
        }) => {
            assert_eq!((provider.as_str(), model.as_str()), ("primary", "p-1"));
            assert!(warning.is_none());
        }
        other => panic!("unexpected {other:?}"),
    }
    match events.last() {
        Some(TurnEvent::Done {
            content,
            usage,
            provider,
            fallback,
            ..
        }) => {
            assert_eq!(content, &delta_text(&events));
            assert_eq!(*usage, Usage::new(10, 5, 15));
            assert_eq!(provider, "primary");
            assert!(fallback.is_none());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn tool_round_sends_no_deltas_and_persists_pairs() {
    let h = harness(
        config().build(),
        ScriptedProvider::new("primary")
            .then_tool_calls(vec![echo_call("call_1", "ping"), echo_call("call_2", "pong")])
            .then_text("both echoed"),
        ScriptedProvider::new("backup"),
    );
    let events = collect(h.orchestrator.stream_turn(TurnRequest::new(alice(), "echo twice"))).await;
    assert_protocol(&events);
    assert_eq!(names(&events), vec!["meta", "delta", "delta", "done"]);
    assert_eq!(delta_text(&events), "both echoed");

    // the second call sees prior history + assistant + results in call order
    let requests = h.primary.requests();
    let second = &requests[1].messages;
    let tail: Vec<(Role, Option<&str>)> = second
        .iter()
        .rev()
        .take(3)
        .rev()
        .map(|m| (m.role, m.tool_call_id.as_deref()))
        .collect();
    assert_eq!(
        tail,
        vec![
            (Role::Assistant, None),
            (Role::Tool, Some("call_1")),
            (Role::Tool, Some("call_2")),
        ]
    );

    let conversation_id = conversation_of(&events);
    let stored = h
        .orchestrator
        .messages("alice", &conversation_id, None)
        .await
        .unwrap();
    let roles: Vec<Role> = stored.iter().map(|m| m.message.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Assistant]
    );
    let messages: Vec<_> = stored.into_iter().map(|m| m.message).collect();
    assert!(tower_turns::history::validate_tool_pairing(&messages).is_none());
}

#[tokio::test]
async fn preparation_failure_still_opens_with_meta() {
    let h = harness(
        config().build(),
        ScriptedProvider::new("primary"),
        ScriptedProvider::new("backup"),
    );
    let request = TurnRequest::new(alice(), "hi").in_conversation("conv_missing");
    let events = collect(h.orchestrator.stream_turn(request)).await;
    assert_protocol(&events);
    assert_eq!(names(&events), vec!["meta", "error"]);
    assert_eq!(error_kind(&events).as_deref(), Some("NotFoundError"));
    assert_eq!(h.primary.calls(), 0);
}

#[tokio::test]
async fn retrieval_without_retriever_warns_on_meta() {
    let h = harness(
        config().build(),
        ScriptedProvider::new("primary").then_text("ok"),
        ScriptedProvider::new("backup"),
    );
    let events = collect(h.orchestrator.stream_turn(TurnRequest::new(alice(), "hi").with_rag(3))).await;
    assert_protocol(&events);
    match &events[0] {
        TurnEvent::Meta { warning, .. } => assert!(warning
            .as_deref()
            .is_some_and(|w| w.contains("no retriever"))),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(events.last().map(TurnEvent::event_name), Some("done"));
}

#[tokio::test]
async fn retrieved_context_is_injected_as_system_message() {
    let primary = Arc::new(ScriptedProvider::new("primary").then_text("grounded"));
    let retriever = StaticRetriever::new(vec![
        RetrievedContext {
            content: "Rust 1.0 shipped in 2015".into(),
            score: 0.9,
            source: Some("notes".into()),
        },
        RetrievedContext {
            content: "unrelated".into(),
            score: 0.1,
            source: None,
        },
    ]);
    let orchestrator = Orchestrator::builder(config().build())
        .provider(primary.clone())
        .retriever(Arc::new(retriever))
        .build()
        .unwrap();

    let out = orchestrator
        .run_turn(TurnRequest::new(alice(), "when did rust ship?").with_rag(1))
        .await
        .unwrap();
    assert_eq!(out.retrieved.len(), 1);
    let requests = primary.requests();
    let sent = &requests[0].messages;
    assert_eq!(sent[0].role, Role::System);
    assert_eq!(sent[0].content, "Relevant context:\n[1] (notes) Rust 1.0 shipped in 2015");
    assert_eq!(sent.last().map(|m| m.content.as_str()), Some("when did rust ship?"));
}

#[tokio::test(start_paused = true)]
async fn dropping_the_stream_cancels_the_turn() {
    let h = harness(
        config().build(),
        ScriptedProvider::new("primary")
            .then_text("a b c d e f")
            .with_delta_delay(Duration::from_millis(100)),
        ScriptedProvider::new("backup"),
    );
    let mut stream = h.orchestrator.stream_turn(TurnRequest::new(alice(), "hi"));
    assert_eq!(stream.next().await.map(|e| e.event_name()), Some("meta"));
    drop(stream);

    let mut recorded = Vec::new();
    for _ in 0..100 {
        recorded = h.orchestrator.metrics_recent("alice", 10);
        if !recorded.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].error_kind.as_deref(), Some("CancellationError"));
    assert!(recorded[0].is_stream);
}

#[tokio::test]
async fn events_serialize_as_sse_frames() {
    let h = harness(
        config().build(),
        ScriptedProvider::new("primary").then_text("fine"),
        ScriptedProvider::new("backup"),
    );
    let events = collect(h.orchestrator.stream_turn(TurnRequest::new(alice(), "hi"))).await;
    let frames: Vec<String> = events.iter().map(TurnEvent::to_sse).collect();
    assert!(frames[0].starts_with("event: meta\ndata: {"));
    assert!(frames.iter().all(|f| f.ends_with("\n\n")));
    let done = frames.last().unwrap();
    assert!(done.starts_with("event: done\n"));
    assert!(done.contains("\"finish_reason\":\"stop\""));
    assert!(!done.contains("\"event\""));
}
