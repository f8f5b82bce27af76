mod common;

use std::sync::Arc;
use std::time::Duration;

use chatloom::breaker::BreakerRegistry;
use chatloom::event_bus::{ChannelSink, EventBus, FlowEvent, MemorySink};
use chatloom::runtime::{ApiRegistry, FlowRuntime, ProcessorRegistry};
use chatloom::store::{
    FlowStore, InMemoryFlowStore, InMemoryIdempotencyLedger, InMemorySessionStore,
};
use chatloom::types::SessionStatus;
use common::linear_flow;

#[tokio::test]
async fn runtime_broadcasts_lifecycle_events_to_sinks() {
    let sink = MemorySink::new();
    let bus = EventBus::with_sink(sink.clone());
    bus.listen();

    let flow = linear_flow();
    let flow_id = flow.id;
    let flows = Arc::new(InMemoryFlowStore::new());
    flows.put(flow).await.unwrap();
    let runtime = FlowRuntime::new(
        Arc::new(InMemorySessionStore::new()),
        flows,
        Arc::new(InMemoryIdempotencyLedger::new()),
        ProcessorRegistry::standard(
            Arc::new(ApiRegistry::new()),
            reqwest::Client::new(),
            BreakerRegistry::default(),
        ),
    )
    .with_event_sender(bus.sender());

    let reply = runtime.start_session(flow_id, None, None).await.unwrap();
    assert_eq!(reply.status, SessionStatus::Completed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    bus.stop().await;

    let events = sink.snapshot();
    assert!(events.iter().any(|e| matches!(
        e,
        FlowEvent::SessionStarted { session_id, .. } if *session_id == reply.session_id
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        FlowEvent::NodeEntered { node_id, .. } if node_id == "hello"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        FlowEvent::StatusChanged { to: SessionStatus::Completed, .. }
    )));
}

#[tokio::test]
async fn channel_sink_forwards_to_an_async_consumer() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let bus = EventBus::with_sink(ChannelSink::new(tx));
    bus.listen();

    bus.sender()
        .send(FlowEvent::diagnostic("sweeper", "tick"))
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.label(), "diagnostic");
    bus.stop().await;
}

#[test]
fn events_render_for_line_sinks() {
    let event = FlowEvent::OutboxSwept {
        processed: 4,
        dead_lettered: 1,
    };
    assert_eq!(
        event.to_string(),
        "outbox sweep: 4 processed, 1 dead-lettered"
    );
    let value = event.to_json_value();
    assert_eq!(value.get("event"), Some(&serde_json::json!("outbox_swept")));
}
