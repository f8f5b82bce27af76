//! Flow definition model: nodes, typed connections, and indexed lookup.
//!
//! A [`FlowDefinition`] is the authored artifact the runtime executes.
//! Definitions are validated on construction so processors can assume
//! well-formed content at runtime: every connection references known
//! nodes, the entry node exists, and node ids are unique.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ConnectionType, NodeType};

/// A single node within a flow.
///
/// `content` is the authored configuration blob whose shape depends on
/// `node_type` (message text, question options, condition list, action
/// list, webhook request, composite mapping).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FlowNode {
    pub node_id: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub content: Value,
}

impl FlowNode {
    pub fn new(node_id: impl Into<String>, node_type: NodeType, content: Value) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            content,
        }
    }
}

/// A typed, directed edge between two nodes of the same flow.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FlowConnection {
    pub source_node_id: String,
    pub target_node_id: String,
    pub connection_type: ConnectionType,
    /// Optional authored predicate attached to the edge. Answer
    /// routing evaluates it against the updated session state when no
    /// typed edge matched; the first edge whose predicate holds wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
}

impl FlowConnection {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        connection_type: ConnectionType,
    ) -> Self {
        Self {
            source_node_id: source.into(),
            target_node_id: target.into(),
            connection_type,
            condition: None,
        }
    }
}

/// Errors raised while validating a flow definition.
#[derive(Debug, Error, Diagnostic)]
pub enum FlowError {
    #[error("duplicate node id: {node_id}")]
    #[diagnostic(
        code(chatloom::flow::duplicate_node),
        help("Node ids must be unique within a flow definition.")
    )]
    DuplicateNode { node_id: String },

    #[error("entry node not found: {node_id}")]
    #[diagnostic(code(chatloom::flow::missing_entry))]
    MissingEntryNode { node_id: String },

    #[error("connection references unknown node: {node_id}")]
    #[diagnostic(
        code(chatloom::flow::dangling_connection),
        help("Both endpoints of every connection must be declared nodes.")
    )]
    DanglingConnection { node_id: String },

    #[error("node not found: {node_id}")]
    #[diagnostic(code(chatloom::flow::node_not_found))]
    NodeNotFound { node_id: String },
}

/// A validated flow definition with indexed node and edge lookup.
///
/// # Examples
///
/// ```rust
/// use chatloom::flow::{FlowDefinition, FlowNode, FlowConnection};
/// use chatloom::types::{ConnectionType, NodeType};
/// use serde_json::json;
///
/// let flow = FlowDefinition::new(
///     "greeting",
///     "hello",
///     vec![
///         FlowNode::new("hello", NodeType::Message, json!({"text": "Hi!"})),
///         FlowNode::new("bye", NodeType::Message, json!({"text": "Bye!"})),
///     ],
///     vec![FlowConnection::new("hello", "bye", ConnectionType::Default)],
/// )
/// .unwrap();
///
/// assert!(flow.node("hello").is_some());
/// assert_eq!(
///     flow.next_connection("hello", ConnectionType::Success)
///         .map(|c| c.target_node_id.as_str()),
///     Some("bye"),
/// );
/// ```
#[derive(Clone, Debug)]
pub struct FlowDefinition {
    pub id: Uuid,
    pub name: String,
    pub version: u32,
    pub entry_node_id: String,
    nodes: FxHashMap<String, FlowNode>,
    /// Outgoing connections keyed by source node, in authored order.
    connections: FxHashMap<String, Vec<FlowConnection>>,
}

impl FlowDefinition {
    pub fn new(
        name: impl Into<String>,
        entry_node_id: impl Into<String>,
        nodes: Vec<FlowNode>,
        connections: Vec<FlowConnection>,
    ) -> Result<Self, FlowError> {
        Self::with_id(Uuid::new_v4(), name, entry_node_id, nodes, connections)
    }

    pub fn with_id(
        id: Uuid,
        name: impl Into<String>,
        entry_node_id: impl Into<String>,
        nodes: Vec<FlowNode>,
        connections: Vec<FlowConnection>,
    ) -> Result<Self, FlowError> {
        let entry_node_id = entry_node_id.into();
        let mut node_map: FxHashMap<String, FlowNode> = FxHashMap::default();
        for node in nodes {
            if node_map.contains_key(&node.node_id) {
                return Err(FlowError::DuplicateNode {
                    node_id: node.node_id,
                });
            }
            node_map.insert(node.node_id.clone(), node);
        }
        if !node_map.contains_key(&entry_node_id) {
            return Err(FlowError::MissingEntryNode {
                node_id: entry_node_id,
            });
        }

        let mut edge_map: FxHashMap<String, Vec<FlowConnection>> = FxHashMap::default();
        for conn in connections {
            if !node_map.contains_key(&conn.source_node_id) {
                return Err(FlowError::DanglingConnection {
                    node_id: conn.source_node_id,
                });
            }
            if !node_map.contains_key(&conn.target_node_id) {
                return Err(FlowError::DanglingConnection {
                    node_id: conn.target_node_id,
                });
            }
            edge_map
                .entry(conn.source_node_id.clone())
                .or_default()
                .push(conn);
        }

        Ok(Self {
            id,
            name: name.into(),
            version: 1,
            entry_node_id,
            nodes: node_map,
            connections: edge_map,
        })
    }

    /// Look up a node by id.
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&FlowNode> {
        self.nodes.get(node_id)
    }

    /// Look up a node by id, surfacing a [`FlowError`] when absent.
    pub fn require_node(&self, node_id: &str) -> Result<&FlowNode, FlowError> {
        self.node(node_id).ok_or_else(|| FlowError::NodeNotFound {
            node_id: node_id.to_string(),
        })
    }

    /// The flow's entry node.
    pub fn entry_node(&self) -> Result<&FlowNode, FlowError> {
        self.require_node(&self.entry_node_id)
    }

    /// Outgoing connections of a node, in authored order.
    #[must_use]
    pub fn connections_from(&self, node_id: &str) -> &[FlowConnection] {
        self.connections
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Select the outgoing connection of the requested type, falling
    /// back to the `Default` edge when no exact match exists.
    #[must_use]
    pub fn next_connection(
        &self,
        node_id: &str,
        connection_type: ConnectionType,
    ) -> Option<&FlowConnection> {
        let edges = self.connections_from(node_id);
        edges
            .iter()
            .find(|c| c.connection_type == connection_type)
            .or_else(|| {
                if connection_type == ConnectionType::Default {
                    None
                } else {
                    edges
                        .iter()
                        .find(|c| c.connection_type == ConnectionType::Default)
                }
            })
    }

    /// Number of nodes in the definition.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
