//! Persistence seams: session, flow, idempotency, and outbox stores.
//!
//! Each store is an async trait so the runtime can run against the
//! in-memory implementations here or the SQLite-backed ones in
//! [`store_sqlite`](crate::store_sqlite) without changing shape.
//!
//! The session store enforces optimistic concurrency: a save carries
//! the revision the caller loaded, and a mismatch with the stored row
//! is a [`StoreError::RevisionConflict`], never a silent overwrite.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::flow::FlowDefinition;
use crate::outbox::{NewOutboxEvent, OutboxEvent};
use crate::state::ConversationSession;
use crate::types::{IdempotencyStatus, OutboxStatus, SessionStatus};

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// A concurrent writer saved the session first.
    #[error("revision conflict on session {session_id}: expected {expected}, found {actual}")]
    #[diagnostic(
        code(chatloom::store::revision_conflict),
        help("Reload the session and replay the mutation against the fresh revision.")
    )]
    RevisionConflict {
        session_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("{kind} '{id}' not found")]
    #[diagnostic(code(chatloom::store::not_found))]
    NotFound { kind: &'static str, id: String },

    #[error("serialization failed: {0}")]
    #[diagnostic(code(chatloom::store::serde))]
    Serde(#[from] serde_json::Error),

    #[error("storage backend error: {message}")]
    #[diagnostic(code(chatloom::store::backend))]
    Backend { message: String },
}

impl StoreError {
    pub fn session_not_found(id: Uuid) -> Self {
        StoreError::NotFound {
            kind: "session",
            id: id.to_string(),
        }
    }

    pub fn flow_not_found(id: Uuid) -> Self {
        StoreError::NotFound {
            kind: "flow",
            id: id.to_string(),
        }
    }
}

/// Durable store for conversation sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session row.
    async fn create(&self, session: &ConversationSession) -> Result<(), StoreError>;

    /// Load a session by id.
    async fn load(&self, id: Uuid) -> Result<Option<ConversationSession>, StoreError>;

    /// Save a mutated session. `expected_revision` is the revision the
    /// caller loaded; the save fails with
    /// [`StoreError::RevisionConflict`] if the stored row has moved on.
    async fn save(
        &self,
        session: &ConversationSession,
        expected_revision: u64,
    ) -> Result<(), StoreError>;

    /// Insert a new session row and record outbox events in the same
    /// atomic step. Either everything lands or nothing does.
    async fn create_with_events(
        &self,
        session: &ConversationSession,
        events: Vec<NewOutboxEvent>,
    ) -> Result<(), StoreError>;

    /// Save a mutated session and record outbox events in the same
    /// atomic step. A failed event insert rolls the session save back.
    async fn save_with_events(
        &self,
        session: &ConversationSession,
        expected_revision: u64,
        events: Vec<NewOutboxEvent>,
    ) -> Result<(), StoreError>;

    /// Mark non-terminal sessions idle since before `cutoff` as
    /// EXPIRED, bumping their revision. Returns the affected ids.
    async fn expire_idle(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;
}

/// Read/write store for flow definitions.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn put(&self, flow: FlowDefinition) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Arc<FlowDefinition>>, StoreError>;
}

/// Result of attempting to claim an idempotency key.
#[derive(Clone, Debug, PartialEq)]
pub enum BeginOutcome {
    /// The key was inserted; the caller owns the work.
    Acquired,
    /// The work already completed; the stored result is returned.
    AlreadyDone(Option<Value>),
    /// Another worker holds the key in PROCESSING.
    InFlight,
}

/// One ledger row.
#[derive(Clone, Debug, PartialEq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// When the record stops blocking new acquisitions (PROCESSING) or
    /// becomes eligible for reaping (COMPLETED/FAILED).
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Exactly-once bookkeeping for async task execution.
///
/// Keys follow `{session_id}:{node_id}:{revision}`, so a retried task
/// against a stale revision claims a different key than the fresh one.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Conditionally insert the key in PROCESSING state. A PROCESSING
    /// record whose expiry has passed (a crashed worker never finished
    /// it) is reclaimed rather than reported in flight.
    async fn begin(&self, key: &str) -> Result<BeginOutcome, StoreError>;

    /// Mark the key COMPLETED, storing the result for replays.
    async fn complete(&self, key: &str, result: Option<Value>) -> Result<(), StoreError>;

    /// Mark the key FAILED so a later attempt may claim it again.
    async fn fail(&self, key: &str, error: &str) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Delete records whose expiry has passed. Returns the count
    /// removed.
    async fn reap_expired(&self) -> Result<u64, StoreError>;
}

/// Durable store for outbox events.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Record a new pending event, returning the stored row.
    async fn insert(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError>;

    /// Claim up to `limit` deliverable events, moving them to
    /// PROCESSING. Deliverable means PENDING with no future
    /// `next_retry_at`, FAILED whose retry time has arrived, or
    /// PROCESSING claimed longer than `stale_after` ago. Ordering is
    /// priority descending, then creation time ascending.
    async fn claim_batch(
        &self,
        limit: usize,
        stale_after: Duration,
    ) -> Result<Vec<OutboxEvent>, StoreError>;

    async fn mark_delivered(&self, id: Uuid) -> Result<(), StoreError>;

    /// Record a failed attempt and schedule the next retry.
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Park the event for manual replay.
    async fn mark_dead_letter(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Manual replay: reset to PENDING with a fresh retry budget.
    async fn reset_for_retry(&self, id: Uuid) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>, StoreError>;

    async fn list_by_status(&self, status: OutboxStatus) -> Result<Vec<OutboxEvent>, StoreError>;
}

/// In-memory session store for tests and single-process runs.
///
/// Transactional event recording needs an attached
/// [`InMemoryOutboxStore`]; both maps mutate under the session lock so
/// the pair behaves like one transaction.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<FxHashMap<Uuid, ConversationSession>>,
    outbox: Option<Arc<InMemoryOutboxStore>>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the outbox store that receives events recorded alongside
    /// session writes.
    #[must_use]
    pub fn with_outbox(mut self, outbox: Arc<InMemoryOutboxStore>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    async fn record_events(&self, events: Vec<NewOutboxEvent>) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let outbox = self.outbox.as_ref().ok_or_else(|| StoreError::Backend {
            message: "no outbox store attached for transactional events".to_string(),
        })?;
        let mut rows = outbox.events.lock().await;
        for event in events {
            let row = event.into_event();
            rows.insert(row.id, row);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: &ConversationSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<ConversationSession>, StoreError> {
        Ok(self.sessions.lock().await.get(&id).cloned())
    }

    async fn save(
        &self,
        session: &ConversationSession,
        expected_revision: u64,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        let stored = sessions
            .get(&session.id)
            .ok_or_else(|| StoreError::session_not_found(session.id))?;
        if stored.revision != expected_revision {
            return Err(StoreError::RevisionConflict {
                session_id: session.id,
                expected: expected_revision,
                actual: stored.revision,
            });
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn create_with_events(
        &self,
        session: &ConversationSession,
        events: Vec<NewOutboxEvent>,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        // Events first: a failure here must leave the session unsaved.
        self.record_events(events).await?;
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn save_with_events(
        &self,
        session: &ConversationSession,
        expected_revision: u64,
        events: Vec<NewOutboxEvent>,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        let stored = sessions
            .get(&session.id)
            .ok_or_else(|| StoreError::session_not_found(session.id))?;
        if stored.revision != expected_revision {
            return Err(StoreError::RevisionConflict {
                session_id: session.id,
                expected: expected_revision,
                actual: stored.revision,
            });
        }
        self.record_events(events).await?;
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn expire_idle(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let mut sessions = self.sessions.lock().await;
        let now = Utc::now();
        let mut expired = Vec::new();
        for session in sessions.values_mut() {
            if !session.status.is_terminal() && session.updated_at <= cutoff {
                session.status = SessionStatus::Expired;
                session.revision += 1;
                session.updated_at = now;
                expired.push(session.id);
            }
        }
        Ok(expired)
    }
}

/// In-memory flow registry.
#[derive(Default)]
pub struct InMemoryFlowStore {
    flows: Mutex<FxHashMap<Uuid, Arc<FlowDefinition>>>,
}

impl InMemoryFlowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn put(&self, flow: FlowDefinition) -> Result<(), StoreError> {
        let mut flows = self.flows.lock().await;
        flows.insert(flow.id, Arc::new(flow));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Arc<FlowDefinition>>, StoreError> {
        Ok(self.flows.lock().await.get(&id).cloned())
    }
}

/// Default PROCESSING hold before a key is considered abandoned.
pub const DEFAULT_PROCESSING_EXPIRY_SECS: i64 = 600;

/// Default retention of terminal records before reaping.
pub const DEFAULT_RECORD_RETENTION_SECS: i64 = 86_400;

/// In-memory idempotency ledger.
pub struct InMemoryIdempotencyLedger {
    records: Mutex<FxHashMap<String, IdempotencyRecord>>,
    processing_expiry: Duration,
    record_retention: Duration,
}

impl Default for InMemoryIdempotencyLedger {
    fn default() -> Self {
        Self {
            records: Mutex::default(),
            processing_expiry: Duration::seconds(DEFAULT_PROCESSING_EXPIRY_SECS),
            record_retention: Duration::seconds(DEFAULT_RECORD_RETENTION_SECS),
        }
    }
}

impl InMemoryIdempotencyLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override how long a PROCESSING hold blocks other acquirers and
    /// how long terminal records survive before reaping.
    #[must_use]
    pub fn with_expiry(mut self, processing_expiry: Duration, record_retention: Duration) -> Self {
        self.processing_expiry = processing_expiry;
        self.record_retention = record_retention;
        self
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryIdempotencyLedger {
    async fn begin(&self, key: &str) -> Result<BeginOutcome, StoreError> {
        let mut records = self.records.lock().await;
        let now = Utc::now();
        match records.get_mut(key) {
            None => {
                records.insert(
                    key.to_string(),
                    IdempotencyRecord {
                        key: key.to_string(),
                        status: IdempotencyStatus::Processing,
                        result: None,
                        error: None,
                        expires_at: now + self.processing_expiry,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(BeginOutcome::Acquired)
            }
            Some(record) => match record.status {
                IdempotencyStatus::Completed => {
                    Ok(BeginOutcome::AlreadyDone(record.result.clone()))
                }
                // An expired hold means the worker died mid-task; the
                // key is reclaimable.
                IdempotencyStatus::Processing if record.expires_at <= now => {
                    record.expires_at = now + self.processing_expiry;
                    record.updated_at = now;
                    Ok(BeginOutcome::Acquired)
                }
                IdempotencyStatus::Processing => Ok(BeginOutcome::InFlight),
                // A failed attempt releases the key for another try.
                IdempotencyStatus::Failed => {
                    record.status = IdempotencyStatus::Processing;
                    record.error = None;
                    record.expires_at = now + self.processing_expiry;
                    record.updated_at = now;
                    Ok(BeginOutcome::Acquired)
                }
            },
        }
    }

    async fn complete(&self, key: &str, result: Option<Value>) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(key).ok_or_else(|| StoreError::NotFound {
            kind: "idempotency key",
            id: key.to_string(),
        })?;
        let now = Utc::now();
        record.status = IdempotencyStatus::Completed;
        record.result = result;
        record.expires_at = now + self.record_retention;
        record.updated_at = now;
        Ok(())
    }

    async fn fail(&self, key: &str, error: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(key).ok_or_else(|| StoreError::NotFound {
            kind: "idempotency key",
            id: key.to_string(),
        })?;
        let now = Utc::now();
        record.status = IdempotencyStatus::Failed;
        record.error = Some(error.to_string());
        record.expires_at = now + self.record_retention;
        record.updated_at = now;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn reap_expired(&self) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let now = Utc::now();
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        Ok((before - records.len()) as u64)
    }
}

/// In-memory outbox store.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    events: Mutex<FxHashMap<Uuid, OutboxEvent>>,
}

impl InMemoryOutboxStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn deliverable(event: &OutboxEvent, now: DateTime<Utc>, stale_after: Duration) -> bool {
    match event.status {
        OutboxStatus::Pending => event.next_retry_at.is_none_or(|at| at <= now),
        OutboxStatus::Failed => event.next_retry_at.is_none_or(|at| at <= now),
        OutboxStatus::Processing => event
            .claimed_at
            .is_some_and(|claimed| now - claimed >= stale_after),
        OutboxStatus::Delivered | OutboxStatus::DeadLetter => false,
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError> {
        let row = event.into_event();
        let mut events = self.events.lock().await;
        events.insert(row.id, row.clone());
        Ok(row)
    }

    async fn claim_batch(
        &self,
        limit: usize,
        stale_after: Duration,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let now = Utc::now();
        let mut events = self.events.lock().await;
        let mut candidates: Vec<Uuid> = events
            .values()
            .filter(|e| deliverable(e, now, stale_after))
            .map(|e| e.id)
            .collect();
        candidates.sort_by(|a, b| {
            let ea = &events[a];
            let eb = &events[b];
            eb.priority
                .cmp(&ea.priority)
                .then(ea.created_at.cmp(&eb.created_at))
        });
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(event) = events.get_mut(&id) {
                event.status = OutboxStatus::Processing;
                event.claimed_at = Some(now);
                event.updated_at = now;
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<(), StoreError> {
        let mut events = self.events.lock().await;
        let event = events.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            kind: "outbox event",
            id: id.to_string(),
        })?;
        let now = Utc::now();
        event.status = OutboxStatus::Delivered;
        event.delivered_at = Some(now);
        event.claimed_at = None;
        event.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut events = self.events.lock().await;
        let event = events.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            kind: "outbox event",
            id: id.to_string(),
        })?;
        event.status = OutboxStatus::Failed;
        event.retry_count += 1;
        event.last_error = Some(error.to_string());
        event.next_retry_at = Some(next_retry_at);
        event.claimed_at = None;
        event.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_dead_letter(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut events = self.events.lock().await;
        let event = events.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            kind: "outbox event",
            id: id.to_string(),
        })?;
        event.status = OutboxStatus::DeadLetter;
        event.retry_count += 1;
        event.last_error = Some(error.to_string());
        event.next_retry_at = None;
        event.claimed_at = None;
        event.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_for_retry(&self, id: Uuid) -> Result<(), StoreError> {
        let mut events = self.events.lock().await;
        let event = events.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            kind: "outbox event",
            id: id.to_string(),
        })?;
        event.status = OutboxStatus::Pending;
        event.retry_count = 0;
        event.next_retry_at = None;
        event.last_error = None;
        event.claimed_at = None;
        event.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>, StoreError> {
        Ok(self.events.lock().await.get(&id).cloned())
    }

    async fn list_by_status(&self, status: OutboxStatus) -> Result<Vec<OutboxEvent>, StoreError> {
        let events = self.events.lock().await;
        let mut rows: Vec<OutboxEvent> = events
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }
}
