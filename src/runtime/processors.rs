//! Node processors: one per [`NodeType`], dispatched through a closed
//! [`ProcessorRegistry`].
//!
//! A processor reads its node's authored `content`, mutates the
//! session, pushes any rendered messages into the context, and returns
//! a [`NodeOutcome`] telling the runner how to continue. Processors
//! never persist; the runner owns revision bumps and saves.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::breaker::BreakerRegistry;
use crate::condition::evaluate;
use crate::flow::FlowNode;
use crate::paths::PathError;
use crate::resolver::{ResolverError, VariableResolver, check_writable};
use crate::runtime::actions::{ActionScope, ApiRegistry, run_actions};
use crate::state::ConversationSession;
use crate::types::{ConnectionType, NodeType};

#[cfg(feature = "delivery-http")]
use chrono::Utc;

#[cfg(feature = "delivery-http")]
use crate::breaker::BreakerError;

/// Errors raised while processing a node.
#[derive(Debug, Error, Diagnostic)]
pub enum ProcessorError {
    /// The node's authored content does not have the shape its type
    /// requires.
    #[error("malformed content on node '{node_id}': {message}")]
    #[diagnostic(
        code(chatloom::processor::malformed_content),
        help("Check the node's authored content against its node type.")
    )]
    MalformedContent { node_id: String, message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] PathError),
}

impl ProcessorError {
    fn malformed(node_id: &str, message: impl Into<String>) -> Self {
        ProcessorError::MalformedContent {
            node_id: node_id.to_string(),
            message: message.into(),
        }
    }
}

/// Why a processor paused the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PauseReason {
    /// A question awaits the user's answer.
    Question,
    /// A message asked for explicit acknowledgement.
    Ack,
}

/// What the runner should do after a node was processed.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeOutcome {
    /// Follow the edge of this type (with `Default` fallback).
    Advance(ConnectionType),
    /// Stop the chain and wait for user input.
    Pause(PauseReason),
    /// Push a sub-flow frame and continue at its entry node.
    EnterSubFlow {
        flow_id: Uuid,
        input: Option<Value>,
    },
}

/// Mutable processing context handed to a processor.
pub struct ProcessorCx<'a> {
    pub session: &'a mut ConversationSession,
    pub node: &'a FlowNode,
    /// Messages rendered so far in this chain; processors append.
    pub messages: &'a mut Vec<Value>,
}

#[async_trait]
pub trait NodeProcessor: Send + Sync {
    async fn process(&self, cx: ProcessorCx<'_>) -> Result<NodeOutcome, ProcessorError>;
}

/// Closed processor registry keyed by node type.
///
/// Dispatch misses are impossible for flows built from the closed
/// [`NodeType`] enum as long as every variant is registered;
/// [`ProcessorRegistry::standard`] registers all of them.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: FxHashMap<NodeType, Arc<dyn NodeProcessor>>,
}

impl ProcessorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in processor for every node type.
    #[must_use]
    pub fn standard(
        api: Arc<ApiRegistry>,
        #[cfg(feature = "delivery-http")] client: reqwest::Client,
        breakers: BreakerRegistry,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(NodeType::Message, Arc::new(MessageProcessor));
        registry.register(NodeType::Question, Arc::new(QuestionProcessor));
        registry.register(NodeType::Condition, Arc::new(ConditionProcessor));
        registry.register(
            NodeType::Action,
            Arc::new(ActionProcessor {
                api: api.clone(),
                breakers: breakers.clone(),
            }),
        );
        registry.register(
            NodeType::Composite,
            Arc::new(CompositeProcessor {
                api,
                breakers: breakers.clone(),
            }),
        );
        #[cfg(feature = "delivery-http")]
        registry.register(
            NodeType::Webhook,
            Arc::new(WebhookProcessor { client, breakers }),
        );
        registry
    }

    pub fn register(&mut self, node_type: NodeType, processor: Arc<dyn NodeProcessor>) {
        self.processors.insert(node_type, processor);
    }

    #[must_use]
    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeProcessor>> {
        self.processors.get(&node_type).cloned()
    }
}

/// Dots in node ids would split state paths, so keys derived from node
/// ids are flattened.
fn path_key(node_id: &str) -> String {
    node_id.replace('.', "_")
}

/// MESSAGE: render text (single `text` or `variants` list with random
/// pick excluding the previous pick), emit it, advance Default.
/// `wait_for_ack: true` pauses the session instead.
pub struct MessageProcessor;

impl MessageProcessor {
    fn pick_variant(cx: &mut ProcessorCx<'_>, variants: &[Value]) -> Option<String> {
        let texts: Vec<&str> = variants.iter().filter_map(Value::as_str).collect();
        if texts.is_empty() {
            return None;
        }
        let cursor_path = format!("system.message_cursor.{}", path_key(&cx.node.node_id));
        let last = cx
            .session
            .state
            .get(&cursor_path)
            .and_then(Value::as_u64)
            .map(|v| v as usize);
        let index = if texts.len() == 1 {
            0
        } else if let Some(last) = last.filter(|last| *last < texts.len()) {
            // Exclude the previously shown variant from the draw.
            let mut index = rand::random_range(0..texts.len() - 1);
            if index >= last {
                index += 1;
            }
            index
        } else {
            // First render: every variant is fair game.
            rand::random_range(0..texts.len())
        };
        if cx.session.state.set(&cursor_path, json!(index)).is_err() {
            tracing::warn!(node_id = %cx.node.node_id, "could not record message cursor");
        }
        Some(texts[index].to_string())
    }
}

#[async_trait]
impl NodeProcessor for MessageProcessor {
    async fn process(&self, mut cx: ProcessorCx<'_>) -> Result<NodeOutcome, ProcessorError> {
        let content = &cx.node.content;
        let raw_text = if let Some(variants) = content.get("variants").and_then(Value::as_array) {
            let variants = variants.clone();
            Self::pick_variant(&mut cx, &variants)
                .ok_or_else(|| ProcessorError::malformed(&cx.node.node_id, "empty variants list"))?
        } else {
            content
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ProcessorError::malformed(&cx.node.node_id, "missing 'text' or 'variants'")
                })?
                .to_string()
        };

        let text = VariableResolver::new(&cx.session.state).resolve_template(&raw_text);
        cx.messages.push(json!({
            "type": "message",
            "node_id": cx.node.node_id,
            "text": text,
        }));

        if content
            .get("wait_for_ack")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            cx.session
                .state
                .set("system.pending_ack", json!(cx.node.node_id))?;
            return Ok(NodeOutcome::Pause(PauseReason::Ack));
        }
        Ok(NodeOutcome::Advance(ConnectionType::Default))
    }
}

/// QUESTION: render the prompt and options, stash the pending question
/// under `system.pending_question`, and pause for input.
pub struct QuestionProcessor;

#[async_trait]
impl NodeProcessor for QuestionProcessor {
    async fn process(&self, cx: ProcessorCx<'_>) -> Result<NodeOutcome, ProcessorError> {
        let content = &cx.node.content;
        let raw_prompt = content
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| ProcessorError::malformed(&cx.node.node_id, "missing 'prompt'"))?;
        let variable = content
            .get("variable")
            .and_then(Value::as_str)
            .unwrap_or("temp.last_answer")
            .to_string();
        check_writable(&variable)?;

        let (prompt, options) = {
            let resolver = VariableResolver::new(&cx.session.state);
            let prompt = resolver.resolve_template(raw_prompt);
            let options = content
                .get("options")
                .map(|o| resolver.resolve_value(o))
                .unwrap_or_else(|| Value::Array(Vec::new()));
            (prompt, options)
        };

        let pending = json!({
            "node_id": cx.node.node_id,
            "variable": variable,
            "options": options,
        });
        cx.session
            .state
            .set("system.pending_question", pending.clone())?;
        cx.messages.push(json!({
            "type": "question",
            "node_id": cx.node.node_id,
            "prompt": prompt,
            "options": options,
        }));
        Ok(NodeOutcome::Pause(PauseReason::Question))
    }
}

/// CONDITION: first matching `{if, then}` entry wins; `then` paths
/// `"$0"`/`"$1"` select the option edges. No match takes
/// `default_path`, or the Default edge.
pub struct ConditionProcessor;

#[async_trait]
impl NodeProcessor for ConditionProcessor {
    async fn process(&self, cx: ProcessorCx<'_>) -> Result<NodeOutcome, ProcessorError> {
        let content = &cx.node.content;
        let conditions = content
            .get("conditions")
            .and_then(Value::as_array)
            .ok_or_else(|| ProcessorError::malformed(&cx.node.node_id, "missing 'conditions'"))?;

        let root = cx.session.state.as_value();
        for entry in conditions {
            let Some(predicate) = entry.get("if") else {
                continue;
            };
            if evaluate(predicate, root) {
                let then = entry.get("then").and_then(Value::as_str).unwrap_or("");
                return Ok(NodeOutcome::Advance(ConnectionType::from_branch_path(then)));
            }
        }
        let fallback = content
            .get("default_path")
            .and_then(Value::as_str)
            .map(ConnectionType::from_branch_path)
            .unwrap_or(ConnectionType::Default);
        Ok(NodeOutcome::Advance(fallback))
    }
}

/// ACTION: run the action list; advance Success when all actions
/// succeeded, Failure otherwise (failures also land under
/// `temp.action_errors`).
pub struct ActionProcessor {
    pub api: Arc<ApiRegistry>,
    pub breakers: BreakerRegistry,
}

#[async_trait]
impl NodeProcessor for ActionProcessor {
    async fn process(&self, cx: ProcessorCx<'_>) -> Result<NodeOutcome, ProcessorError> {
        let actions = cx
            .node
            .content
            .get("actions")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| ProcessorError::malformed(&cx.node.node_id, "missing 'actions'"))?;

        let mut scope = ActionScope::session(&mut cx.session.state);
        let report = run_actions(&mut scope, &actions, &self.api, &self.breakers).await;
        if report.ok() {
            cx.session.state.remove("temp.action_errors");
            Ok(NodeOutcome::Advance(ConnectionType::Success))
        } else {
            cx.session
                .state
                .set("temp.action_errors", report.failures_json())?;
            Ok(NodeOutcome::Advance(ConnectionType::Failure))
        }
    }
}

/// WEBHOOK: resolve the request, execute it through the per-endpoint
/// circuit breaker, and store `{status_code, data, timestamp}` under
/// `response_key` (default `temp.webhook_response`). An authored
/// `response_mapping` table additionally copies individual response
/// fields to state paths. On failure an authored `fallback_response`
/// stands in for the real one and the flow advances Success; without a
/// fallback the error is recorded and the Failure edge is taken.
#[cfg(feature = "delivery-http")]
pub struct WebhookProcessor {
    pub client: reqwest::Client,
    pub breakers: BreakerRegistry,
}

#[cfg(feature = "delivery-http")]
impl WebhookProcessor {
    /// Copy mapped response fields into state. Sources are dotted
    /// paths within the response body; a missing source is skipped.
    fn map_response(
        state: &mut crate::state::StateTree,
        mapping: &Map<String, Value>,
        data: &Value,
    ) -> Result<(), ProcessorError> {
        for (target, source) in mapping {
            check_writable(target)?;
            let Some(source) = source.as_str() else {
                continue;
            };
            match crate::paths::get_by_path(data, source) {
                Some(value) => state.set(target, value.clone())?,
                None => {
                    tracing::debug!(target = %target, source = %source, "response path absent");
                }
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        url: &str,
        method: &str,
        headers: &Value,
        body: Option<Value>,
    ) -> Result<(u16, Value), String> {
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| format!("invalid method '{method}'"))?;
        let mut request = self.client.request(method, url);
        if let Value::Object(map) = headers {
            for (name, value) in map {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        let data = response.json::<Value>().await.unwrap_or(Value::Null);
        if status.is_success() {
            Ok((status.as_u16(), data))
        } else {
            Err(format!("status {status}"))
        }
    }
}

#[cfg(feature = "delivery-http")]
#[async_trait]
impl NodeProcessor for WebhookProcessor {
    #[tracing::instrument(skip(self, cx), fields(node_id = %cx.node.node_id))]
    async fn process(&self, cx: ProcessorCx<'_>) -> Result<NodeOutcome, ProcessorError> {
        let content = &cx.node.content;
        let raw_url = content
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ProcessorError::malformed(&cx.node.node_id, "missing 'url'"))?;
        let method = content
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_string();
        let response_key = content
            .get("response_key")
            .and_then(Value::as_str)
            .unwrap_or("temp.webhook_response")
            .to_string();
        check_writable(&response_key)?;

        let (url, headers, body) = {
            let resolver = VariableResolver::new(&cx.session.state);
            let url = resolver.resolve_template(raw_url);
            let headers = content
                .get("headers")
                .map(|h| resolver.resolve_value(h))
                .unwrap_or(Value::Null);
            let body = content.get("body").map(|b| resolver.resolve_value(b));
            (url, headers, body)
        };

        let breaker = self.breakers.breaker(&url).await;
        let result = breaker
            .call(|| self.execute(&url, &method, &headers, body))
            .await;

        match result {
            Ok((status_code, data)) => {
                if let Some(Value::Object(mapping)) = content.get("response_mapping") {
                    Self::map_response(&mut cx.session.state, mapping, &data)?;
                }
                cx.session.state.set(
                    &response_key,
                    json!({
                        "status_code": status_code,
                        "data": data,
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                )?;
                Ok(NodeOutcome::Advance(ConnectionType::Success))
            }
            Err(e) => {
                let message = match &e {
                    BreakerError::Open { endpoint } => format!("circuit open for {endpoint}"),
                    BreakerError::Call { message } => message.clone(),
                };
                tracing::warn!(url = %url, error = %message, "webhook call failed");
                if let Some(fallback) = content.get("fallback_response") {
                    let fallback = {
                        let resolver = VariableResolver::new(&cx.session.state);
                        resolver.resolve_value(fallback)
                    };
                    // The fallback stands in for the response body, so
                    // the mapping applies to it as well.
                    if let Some(Value::Object(mapping)) = content.get("response_mapping") {
                        Self::map_response(&mut cx.session.state, mapping, &fallback)?;
                    }
                    cx.session.state.set(
                        &response_key,
                        json!({
                            "status_code": 0,
                            "data": fallback,
                            "fallback": true,
                            "timestamp": Utc::now().to_rfc3339(),
                        }),
                    )?;
                    Ok(NodeOutcome::Advance(ConnectionType::Success))
                } else {
                    cx.session.state.set(
                        &response_key,
                        json!({
                            "status_code": 0,
                            "error": message,
                            "timestamp": Utc::now().to_rfc3339(),
                        }),
                    )?;
                    Ok(NodeOutcome::Advance(ConnectionType::Failure))
                }
            }
        }
    }
}

/// COMPOSITE: with a `flow_id` the runner pushes a sub-flow frame;
/// otherwise inline children (`action` and `condition` entries) run in
/// an isolated `{input, output, local}` overlay, and `outputs` map
/// overlay values back into session state. A failing child aborts the
/// composite on the Failure edge.
pub struct CompositeProcessor {
    pub api: Arc<ApiRegistry>,
    pub breakers: BreakerRegistry,
}

impl CompositeProcessor {
    /// Merged view of session state plus the composite overlay, for
    /// evaluating child conditions.
    fn merged_view(session_root: &Value, overlay: &Value) -> Value {
        let mut merged = session_root.clone();
        if let (Value::Object(base), Value::Object(extra)) = (&mut merged, overlay) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

#[async_trait]
impl NodeProcessor for CompositeProcessor {
    async fn process(&self, cx: ProcessorCx<'_>) -> Result<NodeOutcome, ProcessorError> {
        let content = &cx.node.content;

        if let Some(raw_id) = content.get("flow_id").and_then(Value::as_str) {
            let flow_id = raw_id.parse::<Uuid>().map_err(|_| {
                ProcessorError::malformed(&cx.node.node_id, format!("invalid flow_id '{raw_id}'"))
            })?;
            let input = content.get("input").map(|i| {
                VariableResolver::new(&cx.session.state).resolve_value(i)
            });
            return Ok(NodeOutcome::EnterSubFlow { flow_id, input });
        }

        let children = content
            .get("children")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                ProcessorError::malformed(&cx.node.node_id, "missing 'flow_id' or 'children'")
            })?;
        let inputs = content
            .get("inputs")
            .map(|i| VariableResolver::new(&cx.session.state).resolve_value(i))
            .unwrap_or_else(|| Value::Object(Map::new()));

        let mut overlay = json!({
            "input": inputs,
            "output": {},
            "local": {},
        });

        for (index, child) in children.iter().enumerate() {
            let child_type = child.get("type").and_then(Value::as_str).unwrap_or("");
            let actions: Vec<Value> = match child_type {
                "action" => child
                    .get("actions")
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| {
                        ProcessorError::malformed(
                            &cx.node.node_id,
                            format!("child {index} has no 'actions'"),
                        )
                    })?,
                "condition" => {
                    let predicate = child.get("if").unwrap_or(&Value::Null);
                    let view = Self::merged_view(cx.session.state.as_value(), &overlay);
                    let branch = if evaluate(predicate, &view) {
                        child.get("then")
                    } else {
                        child.get("else")
                    };
                    branch
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default()
                }
                other => {
                    return Err(ProcessorError::malformed(
                        &cx.node.node_id,
                        format!("unknown child type '{other}' at {index}"),
                    ));
                }
            };

            let mut scope = ActionScope {
                state: &mut cx.session.state,
                overlay: Some(&mut overlay),
            };
            let report = run_actions(&mut scope, &actions, &self.api, &self.breakers).await;
            if !report.ok() {
                cx.session
                    .state
                    .set("temp.composite_errors", report.failures_json())?;
                return Ok(NodeOutcome::Advance(ConnectionType::Failure));
            }
        }

        if let Some(Value::Object(outputs)) = content.get("outputs") {
            let resolved: Vec<(String, Value)> = {
                let resolver = VariableResolver::new(&cx.session.state).with_overlay(&overlay);
                outputs
                    .iter()
                    .map(|(target, template)| (target.clone(), resolver.resolve_value(template)))
                    .collect()
            };
            for (target, value) in resolved {
                check_writable(&target)?;
                cx.session.state.set(&target, value)?;
            }
        }
        Ok(NodeOutcome::Advance(ConnectionType::Success))
    }
}
