//! Session state management: the scoped state tree, conversation
//! sessions, and the revision/hash bookkeeping behind optimistic
//! concurrency control.
//!
//! # Core types
//!
//! - [`StateTree`]: generic JSON tree with the four session scopes
//!   (`user`, `context`, `temp`, `system`) and dotted-path access
//! - [`ConversationSession`]: a running conversation, versioned by a
//!   monotonic `revision` counter and a canonical `state_hash`
//! - [`FlowFrame`]: one entry of the sub-flow call stack
//!
//! # Examples
//!
//! ```rust
//! use chatloom::state::StateTree;
//! use serde_json::json;
//!
//! let mut state = StateTree::new();
//! state.set("user.name", json!("Ada")).unwrap();
//! state.set("temp.count", json!(3)).unwrap();
//!
//! assert_eq!(state.get("user.name"), Some(&json!("Ada")));
//! assert_eq!(state.get("temp.count"), Some(&json!(3)));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::paths::{self, PathError, canonicalize};
use crate::types::{NodeType, SessionStatus};

/// The session scopes recognized by the state tree and the resolver.
pub const SCOPES: [&str; 4] = ["user", "context", "temp", "system"];

/// Number of interaction history entries retained per session.
pub const HISTORY_CAP: usize = 200;

/// Scoped JSON state tree backing a conversation session.
///
/// The tree always contains the four scope objects. Paths address
/// values as `"scope.rest.of.path"`; reads traverse arrays by numeric
/// segment, writes create intermediate objects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateTree {
    root: Value,
}

impl Default for StateTree {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTree {
    /// Create an empty tree with all scopes present.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: json!({"user": {}, "context": {}, "temp": {}, "system": {}}),
        }
    }

    /// Build a tree from a seed value, filling in any missing scopes.
    #[must_use]
    pub fn from_seed(seed: Value) -> Self {
        let mut root = match seed {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(Map::new()),
        };
        if let Value::Object(map) = &mut root {
            for scope in SCOPES {
                map.entry(scope.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
        }
        Self { root }
    }

    /// Read a value by dotted path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        paths::get_by_path(&self.root, path)
    }

    /// Write a value by dotted path.
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), PathError> {
        paths::set_by_path(&mut self.root, path, value)
    }

    /// Remove a value by dotted path, returning it if present.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        paths::remove_by_path(&mut self.root, path)
    }

    /// Clear one scope back to an empty object.
    pub fn clear_scope(&mut self, scope: &str) {
        if let Value::Object(map) = &mut self.root {
            map.insert(scope.to_string(), Value::Object(Map::new()));
        }
    }

    /// Deep-merge an overlay object into the tree.
    pub fn merge(&mut self, overlay: &Value) {
        paths::deep_merge(&mut self.root, overlay);
    }

    /// The raw root value.
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Hex SHA-256 digest of the canonicalized tree. Stable across
    /// serializations of identical state.
    #[must_use]
    pub fn hash(&self) -> String {
        let canonical = canonicalize(&self.root);
        let serialized = canonical.to_string();
        let digest = Sha256::digest(serialized.as_bytes());
        hex::encode(digest)
    }
}

/// One frame of the sub-flow call stack.
///
/// Pushed when a composite node invokes a sub-flow; popped when the
/// sub-flow runs off its last node, resuming at `return_node_id` in
/// `parent_flow_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowFrame {
    pub parent_flow_id: Uuid,
    pub return_node_id: Option<String>,
    pub composite_node_id: String,
}

/// One entry of the per-session interaction history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InteractionHistoryEntry {
    pub node_id: String,
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_input: Option<Value>,
    pub response: Value,
    pub timestamp: DateTime<Utc>,
}

/// A running conversation session.
///
/// `revision` increments by exactly one on every successful mutation;
/// stores reject writes whose expected revision does not match the
/// current row (optimistic concurrency). `state_hash` is recomputed on
/// every save and lets consumers detect state drift cheaply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub current_flow_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node_id: Option<String>,
    pub status: SessionStatus,
    pub state: StateTree,
    #[serde(default)]
    pub flow_stack: Vec<FlowFrame>,
    #[serde(default)]
    pub history: Vec<InteractionHistoryEntry>,
    pub revision: u64,
    pub state_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSession {
    /// Create a fresh session positioned at a flow's entry node.
    #[must_use]
    pub fn new(flow_id: Uuid, entry_node_id: &str, user_id: Option<String>) -> Self {
        Self::with_state(flow_id, entry_node_id, user_id, StateTree::new())
    }

    /// Create a fresh session with seeded state.
    #[must_use]
    pub fn with_state(
        flow_id: Uuid,
        entry_node_id: &str,
        user_id: Option<String>,
        state: StateTree,
    ) -> Self {
        let now = Utc::now();
        let state_hash = state.hash();
        Self {
            id: Uuid::new_v4(),
            user_id,
            current_flow_id: flow_id,
            current_node_id: Some(entry_node_id.to_string()),
            status: SessionStatus::Active,
            state,
            flow_stack: Vec::new(),
            history: Vec::new(),
            revision: 1,
            state_hash,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump the revision and refresh derived fields. Called once per
    /// logical mutation, immediately before persisting.
    pub fn touch(&mut self) {
        self.revision += 1;
        self.state_hash = self.state.hash();
        self.updated_at = Utc::now();
    }

    /// Append a history entry, evicting the oldest past [`HISTORY_CAP`].
    pub fn record_interaction(&mut self, entry: InteractionHistoryEntry) {
        self.history.push(entry);
        if self.history.len() > HISTORY_CAP {
            let excess = self.history.len() - HISTORY_CAP;
            self.history.drain(..excess);
        }
    }

    /// Push a sub-flow frame and reposition into the sub-flow.
    pub fn push_frame(&mut self, frame: FlowFrame, sub_flow_id: Uuid, entry_node_id: &str) {
        self.flow_stack.push(frame);
        self.current_flow_id = sub_flow_id;
        self.current_node_id = Some(entry_node_id.to_string());
    }

    /// Pop the innermost sub-flow frame, repositioning at its return
    /// node. Returns the popped frame, or `None` on an empty stack.
    pub fn pop_frame(&mut self) -> Option<FlowFrame> {
        let frame = self.flow_stack.pop()?;
        self.current_flow_id = frame.parent_flow_id;
        self.current_node_id = frame.return_node_id.clone();
        Some(frame)
    }
}
