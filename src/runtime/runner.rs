//! The flow runtime: session lifecycle, the bounded non-interactive
//! chain, question answering, and the idempotent task endpoint.
//!
//! Every logical mutation follows the same shape: mutate the session,
//! bump its revision, save with the revision the mutation started
//! from, then record outbox notifications. A concurrent writer shows
//! up as a [`StoreError::RevisionConflict`] through the store seam.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use miette::Diagnostic;
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::condition::evaluate;
use crate::config::RuntimeConfig;
use crate::dispatcher::{DispatchError, NodeTask, TaskDispatcher, TaskStatus};
use crate::event_bus::FlowEvent;
use crate::flow::{FlowDefinition, FlowError};
use crate::outbox::NewOutboxEvent;
use crate::runtime::processors::{
    NodeOutcome, PauseReason, ProcessorCx, ProcessorError, ProcessorRegistry,
};
use crate::state::{ConversationSession, FlowFrame, InteractionHistoryEntry, StateTree};
use crate::store::{BeginOutcome, FlowStore, IdempotencyLedger, SessionStore, StoreError};
use crate::types::{ConnectionType, NodeType, SessionStatus};

/// Errors surfaced by runtime operations.
#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error("flow not found: {flow_id}")]
    #[diagnostic(code(chatloom::runner::flow_not_found))]
    FlowNotFound { flow_id: Uuid },

    #[error("session not found: {session_id}")]
    #[diagnostic(code(chatloom::runner::session_not_found))]
    SessionNotFound { session_id: Uuid },

    #[error("session {session_id} is {status} and accepts no input")]
    #[diagnostic(code(chatloom::runner::terminal_session))]
    TerminalSession {
        session_id: Uuid,
        status: SessionStatus,
    },

    #[error("session {session_id} is not waiting for input")]
    #[diagnostic(
        code(chatloom::runner::not_waiting),
        help("Only sessions in WAITING_FOR_INPUT accept interact calls.")
    )]
    NotWaiting { session_id: Uuid },

    /// The non-interactive chain ran past its bound or revisited a
    /// node, which means the flow loops without pausing.
    #[error("chain limit exceeded after {limit} nodes at '{node_id}'")]
    #[diagnostic(
        code(chatloom::runner::chain_limit),
        help("Non-interactive chains must reach a question or an end within the bound.")
    )]
    ChainLimitExceeded { limit: usize, node_id: String },

    #[error("no processor registered for node type {node_type}")]
    #[diagnostic(code(chatloom::runner::no_processor))]
    NoProcessor { node_type: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Processor(#[from] ProcessorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// What a runtime call hands back to the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct InteractionReply {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub revision: u64,
    /// Messages and question prompts rendered during the chain.
    pub messages: Vec<Value>,
    /// The pending question when the session paused on one.
    pub pending_question: Option<Value>,
}

/// Snapshot of the notification-relevant session fields, taken before
/// a mutation so outbox payloads can carry the transition.
#[derive(Clone, Debug)]
struct Snapshot {
    node_id: Option<String>,
    status: SessionStatus,
    revision: u64,
}

impl Snapshot {
    fn of(session: &ConversationSession) -> Self {
        Self {
            node_id: session.current_node_id.clone(),
            status: session.status,
            revision: session.revision,
        }
    }
}

/// How a chain was entered, which decides whether async-capable
/// action nodes are offloaded or run inline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChainMode {
    /// A user-facing call; async-capable action nodes go to the
    /// dispatcher and the caller gets a processing marker back.
    Interactive,
    /// A dispatched task executing its node; everything runs inline.
    Task,
}

/// The flow execution engine.
///
/// All collaborators are injected: stores, the processor registry, the
/// optional task dispatcher for async action nodes, and the optional
/// event-bus sender for in-process observability. Notifications are
/// recorded through the session store in the same atomic step as the
/// session write.
pub struct FlowRuntime {
    sessions: Arc<dyn SessionStore>,
    flows: Arc<dyn FlowStore>,
    ledger: Arc<dyn IdempotencyLedger>,
    processors: ProcessorRegistry,
    dispatcher: OnceLock<Arc<dyn TaskDispatcher>>,
    events: Option<flume::Sender<FlowEvent>>,
    /// Outbox destinations that receive session notifications.
    notify_destinations: Vec<String>,
    config: RuntimeConfig,
}

impl FlowRuntime {
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        flows: Arc<dyn FlowStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        processors: ProcessorRegistry,
    ) -> Self {
        Self {
            sessions,
            flows,
            ledger,
            processors,
            dispatcher: OnceLock::new(),
            events: None,
            notify_destinations: Vec::new(),
            config: RuntimeConfig::default(),
        }
    }

    /// Attach the dispatcher that receives async-capable action nodes.
    ///
    /// Settable after the runtime is shared behind an `Arc`, since an
    /// in-process dispatcher holds the runtime itself. A second call is
    /// ignored.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn TaskDispatcher>) {
        if self.dispatcher.set(dispatcher).is_err() {
            tracing::warn!("task dispatcher already set, ignoring");
        }
    }

    #[must_use]
    pub fn with_event_sender(mut self, sender: flume::Sender<FlowEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Add an outbox destination (e.g. `webhook:<subscription id>`)
    /// that receives `session.*` notifications.
    #[must_use]
    pub fn with_notify_destination(mut self, destination: impl Into<String>) -> Self {
        self.notify_destinations.push(destination.into());
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    fn emit(&self, event: FlowEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }

    async fn flow(&self, flow_id: Uuid) -> Result<Arc<FlowDefinition>, RunnerError> {
        self.flows
            .get(flow_id)
            .await?
            .ok_or(RunnerError::FlowNotFound { flow_id })
    }

    /// One notification per configured destination for a session
    /// transition. Empty when no destinations are configured.
    fn notification_events(
        &self,
        event_type: &str,
        session: &ConversationSession,
        before: &Snapshot,
    ) -> Vec<NewOutboxEvent> {
        if self.notify_destinations.is_empty() {
            return Vec::new();
        }
        let mut payload = json!({
            "event_type": event_type,
            "timestamp": Utc::now().to_rfc3339(),
            "session_id": session.id,
            "flow_id": session.current_flow_id,
            "data": {
                "current_node": session.current_node_id,
                "previous_node": before.node_id,
                "status": session.status,
                "previous_status": before.status,
                "revision": session.revision,
                "previous_revision": before.revision,
            },
        });
        if let Some(user_id) = &session.user_id
            && let Value::Object(map) = &mut payload
        {
            map.insert("user_id".to_string(), json!(user_id));
        }
        self.notify_destinations
            .iter()
            .map(|destination| {
                NewOutboxEvent::new(event_type, destination.clone(), payload.clone())
                    .max_retries(self.config.outbox.max_retries)
                    .session(session.id)
                    .context(session.current_flow_id, session.user_id.clone())
            })
            .collect()
    }

    /// Bump the revision and save against the revision the mutation
    /// started from, recording the transition notifications in the
    /// same atomic store step.
    async fn persist_and_notify(
        &self,
        session: &mut ConversationSession,
        event_type: &str,
        before: &Snapshot,
    ) -> Result<(), RunnerError> {
        let expected = session.revision;
        session.touch();
        let events = self.notification_events(event_type, session, before);
        if events.is_empty() {
            self.sessions.save(session, expected).await?;
        } else {
            self.sessions
                .save_with_events(session, expected, events)
                .await?;
        }
        Ok(())
    }

    fn set_status(&self, session: &mut ConversationSession, to: SessionStatus) {
        if session.status == to {
            return;
        }
        self.emit(FlowEvent::StatusChanged {
            session_id: session.id,
            from: session.status,
            to,
        });
        session.status = to;
    }

    /// Start a session at a flow's entry node and run the
    /// non-interactive chain.
    #[tracing::instrument(skip(self, seed_state), fields(%flow_id))]
    pub async fn start_session(
        &self,
        flow_id: Uuid,
        user_id: Option<String>,
        seed_state: Option<Value>,
    ) -> Result<InteractionReply, RunnerError> {
        let flow = self.flow(flow_id).await?;
        let state = seed_state.map(StateTree::from_seed).unwrap_or_default();
        let mut session =
            ConversationSession::with_state(flow.id, &flow.entry_node_id, user_id, state);
        let before = Snapshot::of(&session);
        let events = self.notification_events("session.started", &session, &before);
        if events.is_empty() {
            self.sessions.create(&session).await?;
        } else {
            self.sessions.create_with_events(&session, events).await?;
        }

        self.emit(FlowEvent::SessionStarted {
            session_id: session.id,
            flow_id: flow.id,
        });

        self.run_chain(&mut session).await
    }

    /// Answer the pending question (or acknowledge a wait-for-ack
    /// message) and continue the chain.
    #[tracing::instrument(skip(self, user_input), fields(%session_id))]
    pub async fn interact(
        &self,
        session_id: Uuid,
        user_input: Value,
    ) -> Result<InteractionReply, RunnerError> {
        let mut session = self
            .sessions
            .load(session_id)
            .await?
            .ok_or(RunnerError::SessionNotFound { session_id })?;
        if session.status.is_terminal() {
            return Err(RunnerError::TerminalSession {
                session_id,
                status: session.status,
            });
        }
        // A session left ACTIVE mid-chain (a processor error, or an
        // async task still pending) is re-driven from its persisted
        // position; the input applies only to a pending question.
        if session.status == SessionStatus::Active {
            return self.run_chain(&mut session).await;
        }

        let before = Snapshot::of(&session);
        let flow = self.flow(session.current_flow_id).await?;

        if let Some(ack_node) = session
            .state
            .get("system.pending_ack")
            .and_then(Value::as_str)
            .map(str::to_string)
        {
            self.resume_after_ack(&mut session, &flow, &ack_node, user_input)?;
        } else {
            // Blank free text re-presents the question without
            // touching state or the revision.
            if user_input.as_str().is_some_and(|s| s.trim().is_empty()) {
                let pending = session.state.get("system.pending_question").cloned();
                return Ok(InteractionReply {
                    session_id,
                    status: session.status,
                    revision: session.revision,
                    messages: Vec::new(),
                    pending_question: pending,
                });
            }
            self.apply_answer(&mut session, &flow, user_input)?;
        }

        if !session.status.is_terminal() {
            self.set_status(&mut session, SessionStatus::Active);
        }
        self.persist_and_notify(&mut session, "session.status_changed", &before)
            .await?;
        self.run_chain(&mut session).await
    }

    fn resume_after_ack(
        &self,
        session: &mut ConversationSession,
        flow: &FlowDefinition,
        ack_node: &str,
        user_input: Value,
    ) -> Result<(), RunnerError> {
        session.state.remove("system.pending_ack");
        let node_type = flow.require_node(ack_node)?.node_type;
        session.record_interaction(InteractionHistoryEntry {
            node_id: ack_node.to_string(),
            node_type,
            user_input: Some(user_input),
            response: json!({"acknowledged": true}),
            timestamp: Utc::now(),
        });
        self.advance(session, flow, ack_node, ConnectionType::Default);
        Ok(())
    }

    fn apply_answer(
        &self,
        session: &mut ConversationSession,
        flow: &FlowDefinition,
        user_input: Value,
    ) -> Result<(), RunnerError> {
        let pending = session
            .state
            .get("system.pending_question")
            .cloned()
            .ok_or(RunnerError::NotWaiting {
                session_id: session.id,
            })?;
        let question_node = pending
            .get("node_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let variable = pending
            .get("variable")
            .and_then(Value::as_str)
            .unwrap_or("temp.last_answer")
            .to_string();
        let options = pending
            .get("options")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let (preferred, answer) = match match_answer(&user_input, &options) {
            Some((index, value)) => {
                let preferred = match index {
                    0 => Some(ConnectionType::Option0),
                    1 => Some(ConnectionType::Option1),
                    _ => None,
                };
                (preferred, value)
            }
            // Unmatched free text is HTML-escaped before it lands in
            // state; routing falls through to the conditional edges.
            None => {
                let answer = match &user_input {
                    Value::String(text) => Value::String(escape_html(text)),
                    other => other.clone(),
                };
                (None, answer)
            }
        };

        session
            .state
            .set(&variable, answer.clone())
            .map_err(ProcessorError::from)?;
        session.state.remove("system.pending_question");

        let node_type = flow.require_node(&question_node)?.node_type;
        session.record_interaction(InteractionHistoryEntry {
            node_id: question_node.clone(),
            node_type,
            user_input: Some(user_input),
            response: json!({"answer": answer}),
            timestamp: Utc::now(),
        });
        self.advance_answer(session, flow, &question_node, preferred);
        Ok(())
    }

    /// Answer routing, tried in order: the typed OPTION edge of the
    /// matched index, the first edge whose condition holds against the
    /// updated state, the DEFAULT edge, the first edge in authored
    /// order. No edge at all unwinds the sub-flow stack.
    fn advance_answer(
        &self,
        session: &mut ConversationSession,
        flow: &FlowDefinition,
        from_node: &str,
        preferred: Option<ConnectionType>,
    ) {
        let edges = flow.connections_from(from_node);
        let target = preferred
            .and_then(|preferred| edges.iter().find(|c| c.connection_type == preferred))
            .or_else(|| {
                let root = session.state.as_value();
                edges
                    .iter()
                    .find(|c| c.condition.as_ref().is_some_and(|p| evaluate(p, root)))
            })
            .or_else(|| {
                edges
                    .iter()
                    .find(|c| c.connection_type == ConnectionType::Default)
            })
            .or_else(|| edges.first())
            .map(|c| c.target_node_id.clone());
        match target {
            Some(target) => session.current_node_id = Some(target),
            None => self.unwind(session),
        }
    }

    /// Reposition the session along an edge, unwinding the sub-flow
    /// stack when the current flow has no further edge.
    fn advance(
        &self,
        session: &mut ConversationSession,
        flow: &FlowDefinition,
        from_node: &str,
        connection: ConnectionType,
    ) {
        match flow.next_connection(from_node, connection) {
            Some(conn) => {
                session.current_node_id = Some(conn.target_node_id.clone());
            }
            None => self.unwind(session),
        }
    }

    /// Pop sub-flow frames until one yields a return node; an empty
    /// stack completes the session.
    fn unwind(&self, session: &mut ConversationSession) {
        loop {
            match session.pop_frame() {
                Some(_) => {
                    if session.current_node_id.is_some() {
                        break;
                    }
                    // A frame without a return node keeps unwinding.
                }
                None => {
                    session.current_node_id = None;
                    self.set_status(session, SessionStatus::Completed);
                    break;
                }
            }
        }
    }

    /// Process nodes until the session pauses, completes, or hits the
    /// chain bound.
    async fn run_chain(
        &self,
        session: &mut ConversationSession,
    ) -> Result<InteractionReply, RunnerError> {
        self.run_chain_with(session, ChainMode::Interactive).await
    }

    async fn run_chain_with(
        &self,
        session: &mut ConversationSession,
        mode: ChainMode,
    ) -> Result<InteractionReply, RunnerError> {
        let mut messages: Vec<Value> = Vec::new();
        let mut visited: HashSet<(Uuid, String)> = HashSet::new();
        let mut steps = 0usize;
        let limit = self.config.max_chain_length;

        loop {
            let Some(node_id) = session.current_node_id.clone() else {
                self.set_status(session, SessionStatus::Completed);
                let before = Snapshot::of(session);
                self.persist_and_notify(session, "session.status_changed", &before)
                    .await?;
                break;
            };
            if session.status.is_terminal() {
                break;
            }

            steps += 1;
            if steps > limit || !visited.insert((session.current_flow_id, node_id.clone())) {
                return self.fail_chain(session, &node_id, limit).await;
            }

            let flow = self.flow(session.current_flow_id).await?;
            let node = flow.require_node(&node_id)?.clone();

            // Async-capable action nodes leave the interactive chain
            // and run on the dispatcher. The position is already
            // durable, so the task pins the persisted revision and
            // stale replays discard themselves.
            if mode == ChainMode::Interactive
                && node.node_type == NodeType::Action
                && wants_async(&node.content)
                && let Some(dispatcher) = self.dispatcher.get()
            {
                let task = NodeTask::new(session.id, node_id.clone(), session.revision);
                dispatcher.dispatch(task).await?;
                messages.push(json!({
                    "type": "processing",
                    "node_id": node_id,
                }));
                break;
            }

            self.emit(FlowEvent::NodeEntered {
                session_id: session.id,
                node_id: node_id.clone(),
            });

            let processor =
                self.processors
                    .get(node.node_type)
                    .ok_or_else(|| RunnerError::NoProcessor {
                        node_type: node.node_type.to_string(),
                    })?;

            let before = Snapshot::of(session);
            let messages_before = messages.len();
            let outcome = processor
                .process(ProcessorCx {
                    session,
                    node: &node,
                    messages: &mut messages,
                })
                .await?;

            // Non-interactive nodes get a history entry with whatever
            // they rendered; questions record on the answer instead.
            if !matches!(outcome, NodeOutcome::Pause(PauseReason::Question)) {
                let rendered = messages[messages_before..].to_vec();
                session.record_interaction(InteractionHistoryEntry {
                    node_id: node_id.clone(),
                    node_type: node.node_type,
                    user_input: None,
                    response: json!({"messages": rendered}),
                    timestamp: Utc::now(),
                });
            }

            match outcome {
                NodeOutcome::Advance(connection) => {
                    self.advance(session, &flow, &node_id, connection);
                    let completed = session.status.is_terminal();
                    let event_type = if completed {
                        "session.status_changed"
                    } else {
                        "node.entered"
                    };
                    self.persist_and_notify(session, event_type, &before).await?;
                    if completed {
                        break;
                    }
                }
                NodeOutcome::Pause(_) => {
                    self.set_status(session, SessionStatus::WaitingForInput);
                    self.persist_and_notify(session, "session.status_changed", &before)
                        .await?;
                    break;
                }
                NodeOutcome::EnterSubFlow { flow_id, input } => {
                    let sub_flow = self.flow(flow_id).await?;
                    let return_node_id = flow
                        .next_connection(&node_id, ConnectionType::Default)
                        .map(|c| c.target_node_id.clone());
                    session.push_frame(
                        FlowFrame {
                            parent_flow_id: flow.id,
                            return_node_id,
                            composite_node_id: node_id.clone(),
                        },
                        sub_flow.id,
                        &sub_flow.entry_node_id,
                    );
                    if let Some(input) = input {
                        session.state.merge(&json!({ "temp": input }));
                    }
                    self.persist_and_notify(session, "node.entered", &before).await?;
                }
            }
        }

        let pending_question = session.state.get("system.pending_question").cloned();
        Ok(InteractionReply {
            session_id: session.id,
            status: session.status,
            revision: session.revision,
            messages,
            pending_question,
        })
    }

    /// A runaway chain fails the session before surfacing the error.
    async fn fail_chain(
        &self,
        session: &mut ConversationSession,
        node_id: &str,
        limit: usize,
    ) -> Result<InteractionReply, RunnerError> {
        tracing::error!(
            session_id = %session.id,
            node_id,
            limit,
            "chain limit exceeded, failing session"
        );
        let before = Snapshot::of(session);
        self.set_status(session, SessionStatus::Failed);
        self.persist_and_notify(session, "session.status_changed", &before)
            .await?;
        Err(RunnerError::ChainLimitExceeded {
            limit,
            node_id: node_id.to_string(),
        })
    }

    /// Idempotent async-task endpoint.
    ///
    /// Exactly one concurrent caller per key does the work; replays and
    /// races observe [`TaskStatus::AlreadyProcessed`]. Stale revisions
    /// and missing sessions complete the ledger record with a discard
    /// status rather than erroring, so queues never retry them.
    #[tracing::instrument(skip(self), fields(session_id = %task.session_id, node_id = %task.node_id))]
    pub async fn handle_task(&self, task: &NodeTask) -> Result<TaskStatus, RunnerError> {
        match self.ledger.begin(&task.idempotency_key).await? {
            BeginOutcome::AlreadyDone(_) | BeginOutcome::InFlight => {
                return Ok(TaskStatus::AlreadyProcessed);
            }
            BeginOutcome::Acquired => {}
        }

        let Some(mut session) = self.sessions.load(task.session_id).await? else {
            self.ledger
                .complete(
                    &task.idempotency_key,
                    Some(json!({"discarded": "session_not_found"})),
                )
                .await?;
            return Ok(TaskStatus::DiscardedSessionNotFound);
        };

        let stale = session.revision != task.session_revision
            || session.current_node_id.as_deref() != Some(task.node_id.as_str());
        if stale {
            self.ledger
                .complete(&task.idempotency_key, Some(json!({"discarded": "stale"})))
                .await?;
            return Ok(TaskStatus::DiscardedStale);
        }

        match self.run_chain_with(&mut session, ChainMode::Task).await {
            Ok(reply) => {
                self.ledger
                    .complete(
                        &task.idempotency_key,
                        Some(json!({
                            "status": reply.status,
                            "revision": reply.revision,
                        })),
                    )
                    .await?;
                Ok(TaskStatus::Completed)
            }
            Err(e) => {
                self.ledger
                    .fail(&task.idempotency_key, &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    /// Sweep sessions idle past the configured timeout to EXPIRED.
    /// Returns the expired session ids.
    pub async fn expire_idle_sessions(&self) -> Result<Vec<Uuid>, RunnerError> {
        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.session_idle_timeout_secs as i64);
        let expired = self.sessions.expire_idle(cutoff).await?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired idle sessions");
        }
        Ok(expired)
    }
}

/// An action node is offloaded when its content is flagged `async` or
/// any of its actions calls out of process (or carries the flag).
fn wants_async(content: &Value) -> bool {
    if content.get("async").and_then(Value::as_bool).unwrap_or(false) {
        return true;
    }
    content
        .get("actions")
        .and_then(Value::as_array)
        .is_some_and(|actions| {
            actions.iter().any(|action| {
                action
                    .get("async")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                    || action.get("type").and_then(Value::as_str) == Some("api_call")
            })
        })
}

/// Escape the HTML-significant characters of free-text input before it
/// is stored in session state.
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Match a user answer against question options.
///
/// Priority: option `payload`, then `value`, then case-insensitive
/// `label`, then numeric index. Returns the matched index and the
/// value to store (`value`, falling back to `label`, falling back to
/// the raw input).
fn match_answer(input: &Value, options: &[Value]) -> Option<(usize, Value)> {
    for (index, option) in options.iter().enumerate() {
        if option.get("payload").is_some_and(|p| p == input) {
            return Some((index, option_value(option, input)));
        }
    }
    for (index, option) in options.iter().enumerate() {
        if option.get("value").is_some_and(|v| v == input) {
            return Some((index, option_value(option, input)));
        }
    }
    if let Some(text) = input.as_str() {
        for (index, option) in options.iter().enumerate() {
            if option
                .get("label")
                .and_then(Value::as_str)
                .is_some_and(|label| label.eq_ignore_ascii_case(text))
            {
                return Some((index, option_value(option, input)));
            }
        }
    }
    let index = input
        .as_u64()
        .or_else(|| input.as_str().and_then(|s| s.trim().parse().ok()))
        .map(|n| n as usize)?;
    if index < options.len() {
        return Some((index, option_value(&options[index], input)));
    }
    None
}

fn option_value(option: &Value, input: &Value) -> Value {
    option
        .get("value")
        .or_else(|| option.get("label"))
        .cloned()
        .unwrap_or_else(|| input.clone())
}
