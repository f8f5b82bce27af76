//! Core domain enums for the chatloom flow engine.
//!
//! These closed enums identify node types, connection types, and the
//! lifecycle statuses used by sessions, the idempotency ledger, and the
//! event outbox. Each carries an `encode`/`decode` string form used by
//! the persistence layer so database rows stay human-readable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of a node within a flow definition.
///
/// The set is closed on purpose: processors are registered per variant
/// and an unknown type is a definition error, not a runtime dispatch
/// miss.
///
/// # Examples
///
/// ```rust
/// use chatloom::types::NodeType;
///
/// assert_eq!(NodeType::Question.encode(), "QUESTION");
/// assert_eq!(NodeType::decode("WEBHOOK"), Some(NodeType::Webhook));
/// assert_eq!(NodeType::decode("SCRIPT"), None);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    /// Emits one or more messages and advances automatically.
    Message,
    /// Presents a prompt with options and pauses for user input.
    Question,
    /// Branches on predicates evaluated against session state.
    Condition,
    /// Mutates session state through a list of action operations.
    Action,
    /// Calls an external HTTP endpoint through a circuit breaker.
    Webhook,
    /// Invokes a sub-flow or runs inline child nodes in an isolated scope.
    Composite,
}

impl NodeType {
    /// Encode into the persisted string form.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            NodeType::Message => "MESSAGE",
            NodeType::Question => "QUESTION",
            NodeType::Condition => "CONDITION",
            NodeType::Action => "ACTION",
            NodeType::Webhook => "WEBHOOK",
            NodeType::Composite => "COMPOSITE",
        }
    }

    /// Decode a persisted string form. Unknown strings are `None`;
    /// callers surface that as a flow definition error.
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "MESSAGE" => Some(NodeType::Message),
            "QUESTION" => Some(NodeType::Question),
            "CONDITION" => Some(NodeType::Condition),
            "ACTION" => Some(NodeType::Action),
            "WEBHOOK" => Some(NodeType::Webhook),
            "COMPOSITE" => Some(NodeType::Composite),
            _ => None,
        }
    }

    /// Whether processing this node pauses the session for user input.
    #[must_use]
    pub fn is_interactive(&self) -> bool {
        matches!(self, NodeType::Question)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Type of a connection between two flow nodes.
///
/// Connection selection tries the requested type first and falls back
/// to [`ConnectionType::Default`] when no edge of that type exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionType {
    /// Unconditional next edge.
    Default,
    /// Taken when the source node succeeded.
    Success,
    /// Taken when the source node failed.
    Failure,
    /// First branch of a condition or question (`"$0"` path).
    Option0,
    /// Second branch of a condition or question (`"$1"` path).
    Option1,
}

impl ConnectionType {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            ConnectionType::Default => "DEFAULT",
            ConnectionType::Success => "SUCCESS",
            ConnectionType::Failure => "FAILURE",
            ConnectionType::Option0 => "OPTION_0",
            ConnectionType::Option1 => "OPTION_1",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "DEFAULT" => Some(ConnectionType::Default),
            "SUCCESS" => Some(ConnectionType::Success),
            "FAILURE" => Some(ConnectionType::Failure),
            "OPTION_0" => Some(ConnectionType::Option0),
            "OPTION_1" => Some(ConnectionType::Option1),
            _ => None,
        }
    }

    /// Map a condition `then` path to a connection type.
    ///
    /// `"$0"` and `"$1"` select the option edges; anything else selects
    /// the default edge.
    #[must_use]
    pub fn from_branch_path(path: &str) -> Self {
        match path {
            "$0" => ConnectionType::Option0,
            "$1" => ConnectionType::Option1,
            _ => ConnectionType::Default,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Lifecycle status of a conversation session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    WaitingForInput,
    Completed,
    Failed,
    Expired,
}

impl SessionStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::WaitingForInput => "WAITING_FOR_INPUT",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Failed => "FAILED",
            SessionStatus::Expired => "EXPIRED",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(SessionStatus::Active),
            "WAITING_FOR_INPUT" => Some(SessionStatus::WaitingForInput),
            "COMPLETED" => Some(SessionStatus::Completed),
            "FAILED" => Some(SessionStatus::Failed),
            "EXPIRED" => Some(SessionStatus::Expired),
            _ => None,
        }
    }

    /// A terminal session accepts no further interactions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Expired
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Delivery status of an outbox event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Recorded, waiting for a sweep to pick it up.
    Pending,
    /// Claimed by a sweep, delivery in flight.
    Processing,
    /// Delivered to the destination adapter.
    Delivered,
    /// Delivery failed, scheduled for retry.
    Failed,
    /// Retries exhausted; requires manual replay.
    DeadLetter,
}

impl OutboxStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Delivered => "DELIVERED",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OutboxStatus::Pending),
            "PROCESSING" => Some(OutboxStatus::Processing),
            "DELIVERED" => Some(OutboxStatus::Delivered),
            "FAILED" => Some(OutboxStatus::Failed),
            "DEAD_LETTER" => Some(OutboxStatus::DeadLetter),
            _ => None,
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Status of an idempotency ledger record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            IdempotencyStatus::Processing => "PROCESSING",
            IdempotencyStatus::Completed => "COMPLETED",
            IdempotencyStatus::Failed => "FAILED",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "PROCESSING" => Some(IdempotencyStatus::Processing),
            "COMPLETED" => Some(IdempotencyStatus::Completed),
            "FAILED" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}
