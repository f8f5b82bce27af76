mod common;

use std::sync::Arc;

use chatloom::breaker::BreakerRegistry;
use chatloom::runtime::{ApiRegistry, FlowRuntime, ProcessorRegistry};
use chatloom::store::{
    FlowStore, InMemoryFlowStore, InMemoryIdempotencyLedger, InMemoryOutboxStore,
    InMemorySessionStore, OutboxStore, SessionStore,
};
use chatloom::types::OutboxStatus;
use common::linear_flow;
use serde_json::json;

async fn runtime_with_outbox(
    flows_defs: Vec<chatloom::flow::FlowDefinition>,
) -> (FlowRuntime, Arc<InMemoryOutboxStore>) {
    let outbox_store = Arc::new(InMemoryOutboxStore::new());
    let sessions = Arc::new(InMemorySessionStore::new().with_outbox(outbox_store.clone()));
    let flows = Arc::new(InMemoryFlowStore::new());
    for flow in flows_defs {
        flows.put(flow).await.unwrap();
    }
    let runtime = FlowRuntime::new(
        sessions,
        flows,
        Arc::new(InMemoryIdempotencyLedger::new()),
        ProcessorRegistry::standard(
            Arc::new(ApiRegistry::new()),
            reqwest::Client::new(),
            BreakerRegistry::default(),
        ),
    )
    .with_notify_destination("webhook:https://ops.example.com/hook");
    (runtime, outbox_store)
}

#[tokio::test]
async fn session_transitions_are_recorded_as_pending_events() {
    let flow = linear_flow();
    let flow_id = flow.id;
    let (runtime, outbox_store) = runtime_with_outbox(vec![flow]).await;

    let reply = runtime.start_session(flow_id, None, None).await.unwrap();

    let pending = outbox_store
        .list_by_status(OutboxStatus::Pending)
        .await
        .unwrap();
    assert!(!pending.is_empty());
    assert!(pending.iter().all(|e| e.session_id == Some(reply.session_id)));
    assert!(pending.iter().all(|e| e.flow_id == Some(flow_id)));
    assert!(
        pending
            .iter()
            .any(|e| e.event_type == "session.status_changed")
    );

    // The completion notification carries the transition.
    let completion = pending
        .iter()
        .find(|e| {
            e.payload.get("data").and_then(|d| d.get("status")) == Some(&json!("COMPLETED"))
        })
        .unwrap();
    assert_eq!(
        completion.payload.get("session_id"),
        Some(&json!(reply.session_id))
    );
    assert_eq!(completion.payload.get("flow_id"), Some(&json!(flow_id)));
}

#[tokio::test]
async fn node_entries_notify_with_previous_and_current_node() {
    let flow = linear_flow();
    let flow_id = flow.id;
    let (runtime, outbox_store) = runtime_with_outbox(vec![flow]).await;

    runtime.start_session(flow_id, None, None).await.unwrap();

    let pending = outbox_store
        .list_by_status(OutboxStatus::Pending)
        .await
        .unwrap();
    // hello -> bye is a non-terminal advance, so it notifies as a node
    // entry rather than a status change.
    let node_entered = pending
        .iter()
        .find(|e| e.event_type == "node.entered")
        .unwrap();
    let data = node_entered.payload.get("data").unwrap();
    assert_eq!(data.get("previous_node"), Some(&json!("hello")));
    assert_eq!(data.get("current_node"), Some(&json!("bye")));
}

#[tokio::test]
async fn no_destinations_means_no_recorded_events() {
    let flow = linear_flow();
    let flow_id = flow.id;
    let outbox_store = Arc::new(InMemoryOutboxStore::new());
    let sessions = Arc::new(InMemorySessionStore::new().with_outbox(outbox_store.clone()));
    let flows = Arc::new(InMemoryFlowStore::new());
    flows.put(flow).await.unwrap();
    let runtime = FlowRuntime::new(
        sessions,
        flows,
        Arc::new(InMemoryIdempotencyLedger::new()),
        ProcessorRegistry::standard(
            Arc::new(ApiRegistry::new()),
            reqwest::Client::new(),
            BreakerRegistry::default(),
        ),
    );

    runtime.start_session(flow_id, None, None).await.unwrap();
    let pending = outbox_store
        .list_by_status(OutboxStatus::Pending)
        .await
        .unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn failed_event_recording_rolls_the_session_save_back() {
    let flow = common::question_flow();
    let flow_id = flow.id;
    let sessions = Arc::new(InMemorySessionStore::new());
    let flows = Arc::new(InMemoryFlowStore::new());
    flows.put(flow).await.unwrap();
    let processors = || {
        ProcessorRegistry::standard(
            Arc::new(ApiRegistry::new()),
            reqwest::Client::new(),
            BreakerRegistry::default(),
        )
    };

    // Reach the question with a runtime that records no events.
    let quiet = FlowRuntime::new(
        sessions.clone(),
        flows.clone(),
        Arc::new(InMemoryIdempotencyLedger::new()),
        processors(),
    );
    let reply = quiet.start_session(flow_id, None, None).await.unwrap();
    let before = sessions.load(reply.session_id).await.unwrap().unwrap();

    // Destinations configured but no outbox store attached: recording
    // the events fails, and the session save must fail with it.
    let notifying = FlowRuntime::new(
        sessions.clone(),
        flows,
        Arc::new(InMemoryIdempotencyLedger::new()),
        processors(),
    )
    .with_notify_destination("webhook:https://ops.example.com/hook");

    let result = notifying.interact(reply.session_id, json!("coffee")).await;
    assert!(result.is_err());

    let after = sessions.load(reply.session_id).await.unwrap().unwrap();
    assert_eq!(after.revision, before.revision);
    assert_eq!(after.status, before.status);
    assert_eq!(after.state.as_value(), before.state.as_value());
}
