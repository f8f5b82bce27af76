//! # Chatloom: Conversational Flow Execution Engine
//!
//! Chatloom executes authored conversation flows against versioned
//! sessions, with reliable outbound event delivery. The pieces:
//!
//! - **Flows**: validated node/edge definitions ([`flow`]) processed by
//!   a closed per-node-type processor registry ([`runtime::processors`])
//! - **Sessions**: a scoped JSON state tree with a monotonic revision
//!   and canonical state hash ([`state`]), saved through optimistic
//!   concurrency ([`store`])
//! - **Variables**: `{{scope.path}}` resolution over session state
//!   ([`resolver`]) and a JSON predicate language for branching
//!   ([`condition`])
//! - **Reliability**: a transactional event outbox with sweeps, retry
//!   backoff, and dead-lettering ([`outbox`]), per-endpoint circuit
//!   breakers ([`breaker`]), and an idempotency ledger behind the
//!   async task dispatcher ([`dispatcher`])
//!
//! ## Quick start
//!
//! Define a flow, start a session, and answer its question:
//!
//! ```
//! use std::sync::Arc;
//! use chatloom::flow::{FlowConnection, FlowDefinition, FlowNode};
//! use chatloom::runtime::{ApiRegistry, FlowRuntime, ProcessorRegistry};
//! use chatloom::store::{
//!     FlowStore, InMemoryFlowStore, InMemoryIdempotencyLedger, InMemorySessionStore,
//! };
//! use chatloom::types::{ConnectionType, NodeType, SessionStatus};
//! use serde_json::json;
//!
//! # #[cfg(feature = "delivery-http")]
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let flow = FlowDefinition::new(
//!     "greeting",
//!     "ask",
//!     vec![
//!         FlowNode::new("ask", NodeType::Question, json!({
//!             "prompt": "Coffee or tea?",
//!             "variable": "temp.drink",
//!             "options": [{"label": "Coffee"}, {"label": "Tea"}],
//!         })),
//!         FlowNode::new("bye", NodeType::Message, json!({
//!             "text": "Enjoy your {{temp.drink}}!",
//!         })),
//!     ],
//!     vec![FlowConnection::new("ask", "bye", ConnectionType::Default)],
//! )?;
//! let flow_id = flow.id;
//!
//! let flows = Arc::new(InMemoryFlowStore::new());
//! flows.put(flow).await?;
//!
//! let runtime = FlowRuntime::new(
//!     Arc::new(InMemorySessionStore::new()),
//!     flows,
//!     Arc::new(InMemoryIdempotencyLedger::new()),
//!     ProcessorRegistry::standard(
//!         Arc::new(ApiRegistry::new()),
//!         reqwest::Client::new(),
//!         chatloom::breaker::BreakerRegistry::default(),
//!     ),
//! );
//!
//! let started = runtime.start_session(flow_id, None, None).await?;
//! assert_eq!(started.status, SessionStatus::WaitingForInput);
//!
//! let reply = runtime.interact(started.session_id, json!("Tea")).await?;
//! assert_eq!(reply.status, SessionStatus::Completed);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```
//!
//! ## Module guide
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`types`] | Closed domain enums with encode/decode string forms |
//! | [`paths`] | Dotted-path JSON helpers and canonicalization |
//! | [`flow`] | Flow definitions with validated nodes and typed edges |
//! | [`state`] | State tree, sessions, revisions, interaction history |
//! | [`resolver`] | `{{scope.path}}` variable resolution |
//! | [`condition`] | JSON predicate evaluation for branching |
//! | [`runtime`] | The flow runtime, processors, and actions |
//! | [`store`] | Store traits with in-memory implementations |
//! | [`store_sqlite`] | SQLite-backed stores (feature `sqlite`) |
//! | [`outbox`] | Durable event outbox, sweeper, delivery adapters |
//! | [`dispatcher`] | Idempotent async task dispatch |
//! | [`breaker`] | Per-endpoint circuit breakers |
//! | [`event_bus`] | In-process observability event bus |
//! | [`config`] | Runtime configuration from values and environment |
//! | [`telemetry`] | Tracing subscriber setup |

pub mod breaker;
pub mod condition;
pub mod config;
pub mod dispatcher;
pub mod event_bus;
pub mod flow;
pub mod outbox;
pub mod paths;
pub mod resolver;
pub mod runtime;
pub mod state;
pub mod store;
#[cfg(feature = "sqlite")]
pub mod store_sqlite;
pub mod telemetry;
pub mod types;
