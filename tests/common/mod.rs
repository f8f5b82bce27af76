//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;

use chatloom::breaker::BreakerRegistry;
use chatloom::flow::{FlowConnection, FlowDefinition, FlowNode};
use chatloom::runtime::{ApiRegistry, FlowRuntime, ProcessorRegistry};
use chatloom::store::{
    FlowStore, InMemoryFlowStore, InMemoryIdempotencyLedger, InMemorySessionStore,
};
use chatloom::types::{ConnectionType, NodeType};

/// Handles to a runtime plus its injected in-memory stores.
pub struct TestHarness {
    pub runtime: Arc<FlowRuntime>,
    pub sessions: Arc<InMemorySessionStore>,
    pub flows: Arc<InMemoryFlowStore>,
    pub ledger: Arc<InMemoryIdempotencyLedger>,
    pub api: Arc<ApiRegistry>,
}

pub async fn harness(flow_defs: Vec<FlowDefinition>) -> TestHarness {
    let sessions = Arc::new(InMemorySessionStore::new());
    let flows = Arc::new(InMemoryFlowStore::new());
    let ledger = Arc::new(InMemoryIdempotencyLedger::new());
    let api = Arc::new(ApiRegistry::new());
    for flow in flow_defs {
        flows.put(flow).await.unwrap();
    }
    let runtime = Arc::new(FlowRuntime::new(
        sessions.clone(),
        flows.clone(),
        ledger.clone(),
        ProcessorRegistry::standard(
            api.clone(),
            reqwest::Client::new(),
            BreakerRegistry::default(),
        ),
    ));
    TestHarness {
        runtime,
        sessions,
        flows,
        ledger,
        api,
    }
}

/// `hello -> bye`, two messages, completes without input.
pub fn linear_flow() -> FlowDefinition {
    FlowDefinition::new(
        "linear",
        "hello",
        vec![
            FlowNode::new("hello", NodeType::Message, json!({"text": "Hello!"})),
            FlowNode::new("bye", NodeType::Message, json!({"text": "Bye!"})),
        ],
        vec![FlowConnection::new("hello", "bye", ConnectionType::Default)],
    )
    .unwrap()
}

/// One question with two options, each leading to its own farewell.
pub fn question_flow() -> FlowDefinition {
    FlowDefinition::new(
        "drinks",
        "ask",
        vec![
            FlowNode::new(
                "ask",
                NodeType::Question,
                json!({
                    "prompt": "Coffee or tea?",
                    "variable": "temp.drink",
                    "options": [
                        {"label": "Coffee", "value": "coffee"},
                        {"label": "Tea", "value": "tea"},
                    ],
                }),
            ),
            FlowNode::new(
                "coffee",
                NodeType::Message,
                json!({"text": "One {{temp.drink}} coming up."}),
            ),
            FlowNode::new("tea", NodeType::Message, json!({"text": "Steeping."})),
        ],
        vec![
            FlowConnection::new("ask", "coffee", ConnectionType::Option0),
            FlowConnection::new("ask", "tea", ConnectionType::Option1),
        ],
    )
    .unwrap()
}

/// Condition branching on `user.tier`.
pub fn condition_flow() -> FlowDefinition {
    FlowDefinition::new(
        "tiered",
        "route",
        vec![
            FlowNode::new(
                "route",
                NodeType::Condition,
                json!({
                    "conditions": [
                        {"if": {"var": "user.tier", "eq": "gold"}, "then": "$0"},
                    ],
                    "default_path": "$1",
                }),
            ),
            FlowNode::new("vip", NodeType::Message, json!({"text": "Welcome back!"})),
            FlowNode::new("std", NodeType::Message, json!({"text": "Hello."})),
        ],
        vec![
            FlowConnection::new("route", "vip", ConnectionType::Option0),
            FlowConnection::new("route", "std", ConnectionType::Option1),
        ],
    )
    .unwrap()
}
