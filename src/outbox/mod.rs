//! Durable event outbox: events recorded alongside session mutations
//! and delivered asynchronously by a sweeper.
//!
//! Producers never call delivery adapters directly. They append an
//! [`OutboxEvent`] in the same logical step as the state change that
//! caused it, and [`service::OutboxService::sweep`] later claims
//! pending events and routes them to destination adapters with retry
//! backoff and dead-lettering.

pub mod delivery;
pub mod service;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::OutboxStatus;

/// Named priority levels for recorded events. Higher values are
/// claimed first within a sweep batch.
pub mod priority {
    pub const LOW: i32 = -10;
    pub const NORMAL: i32 = 0;
    pub const HIGH: i32 = 10;
    pub const CRITICAL: i32 = 20;
}

/// A recorded event awaiting (or past) delivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    /// Classifier such as `session.status_changed` or `node.entered`.
    pub event_type: String,
    /// Destination address with a routing prefix: `webhook:`, `slack:`,
    /// `email:`, or `internal:`.
    pub destination: String,
    pub payload: Value,
    pub status: OutboxStatus,
    /// Higher priority events are claimed first.
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Set when a sweep claims the event; used to detect stale claims.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a producer supplies when recording an event.
#[derive(Clone, Debug)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub destination: String,
    pub payload: Value,
    pub priority: i32,
    pub max_retries: u32,
    pub session_id: Option<Uuid>,
    pub flow_id: Option<Uuid>,
    pub user_id: Option<String>,
}

impl NewOutboxEvent {
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        destination: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            destination: destination.into(),
            payload,
            priority: priority::NORMAL,
            max_retries: 3,
            session_id: None,
            flow_id: None,
            user_id: None,
        }
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Attach traceability context (nullable, informational only).
    #[must_use]
    pub fn context(mut self, flow_id: Uuid, user_id: Option<String>) -> Self {
        self.flow_id = Some(flow_id);
        self.user_id = user_id;
        self
    }

    /// Materialize a pending event row.
    #[must_use]
    pub fn into_event(self) -> OutboxEvent {
        let now = Utc::now();
        OutboxEvent {
            id: Uuid::new_v4(),
            event_type: self.event_type,
            destination: self.destination,
            payload: self.payload,
            status: OutboxStatus::Pending,
            priority: self.priority,
            retry_count: 0,
            max_retries: self.max_retries,
            next_retry_at: None,
            last_error: None,
            claimed_at: None,
            delivered_at: None,
            session_id: self.session_id,
            flow_id: self.flow_id,
            user_id: self.user_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome counters for one sweep pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Events claimed and attempted this pass.
    pub processed: usize,
    pub succeeded: usize,
    /// Failures rescheduled for a later retry.
    pub failed: usize,
    /// Failures past their retry budget, parked for manual replay.
    pub dead_lettered: usize,
    /// Claimed events skipped without an attempt (no adapter match).
    pub skipped: usize,
}
