//! SQLite-backed stores: sessions, idempotency ledger, and outbox on
//! one pool.
//!
//! Rows keep the human-readable encoded string forms of the domain
//! enums and RFC 3339 timestamps, so the tables stay inspectable with
//! plain `sqlite3`. Conversions to and from row structs are explicit;
//! a corrupt row surfaces as [`StoreError::Backend`] instead of a
//! panic.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::outbox::{NewOutboxEvent, OutboxEvent};
use crate::state::{ConversationSession, FlowFrame, InteractionHistoryEntry, StateTree};
use crate::store::{
    BeginOutcome, IdempotencyLedger, IdempotencyRecord, OutboxStore, SessionStore, StoreError,
};
use crate::types::{IdempotencyStatus, OutboxStatus, SessionStatus};

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend {
            message: e.to_string(),
        }
    }
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Backend {
        message: format!("corrupt {what}: {detail}"),
    }
}

fn parse_uuid(s: &str, what: &str) -> Result<Uuid, StoreError> {
    s.parse().map_err(|_| corrupt(what, s))
}

fn parse_time(s: &str, what: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| corrupt(what, s))
}

fn parse_opt_time(s: Option<&str>, what: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|s| parse_time(s, what)).transpose()
}

/// All stores over one SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    ledger_processing_expiry: Duration,
    ledger_record_retention: Duration,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and run the
    /// embedded migrations when the `sqlite-migrations` feature is on.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(StoreError::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self::with_pool(pool);
        #[cfg(feature = "sqlite-migrations")]
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool. Callers run migrations themselves.
    #[must_use]
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            ledger_processing_expiry: Duration::seconds(
                crate::store::DEFAULT_PROCESSING_EXPIRY_SECS,
            ),
            ledger_record_retention: Duration::seconds(crate::store::DEFAULT_RECORD_RETENTION_SECS),
        }
    }

    /// Override the ledger's PROCESSING hold and terminal-record
    /// retention windows.
    #[must_use]
    pub fn with_ledger_expiry(
        mut self,
        processing_expiry: Duration,
        record_retention: Duration,
    ) -> Self {
        self.ledger_processing_expiry = processing_expiry;
        self.ledger_record_retention = record_retention;
        self
    }

    #[cfg(feature = "sqlite-migrations")]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend {
                message: e.to_string(),
            })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(FromRow)]
struct SessionRow {
    id: String,
    user_id: Option<String>,
    current_flow_id: String,
    current_node_id: Option<String>,
    status: String,
    state: String,
    flow_stack: String,
    history: String,
    revision: i64,
    state_hash: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<SessionRow> for ConversationSession {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, StoreError> {
        let state: StateTree = serde_json::from_str(&row.state)?;
        let flow_stack: Vec<FlowFrame> = serde_json::from_str(&row.flow_stack)?;
        let history: Vec<InteractionHistoryEntry> = serde_json::from_str(&row.history)?;
        Ok(ConversationSession {
            id: parse_uuid(&row.id, "session id")?,
            user_id: row.user_id,
            current_flow_id: parse_uuid(&row.current_flow_id, "session flow id")?,
            current_node_id: row.current_node_id,
            status: SessionStatus::decode(&row.status)
                .ok_or_else(|| corrupt("session status", &row.status))?,
            state,
            flow_stack,
            history,
            revision: row.revision as u64,
            state_hash: row.state_hash,
            created_at: parse_time(&row.created_at, "session created_at")?,
            updated_at: parse_time(&row.updated_at, "session updated_at")?,
        })
    }
}

async fn insert_session_row<'e, E>(
    executor: E,
    session: &ConversationSession,
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO sessions \
         (id, user_id, current_flow_id, current_node_id, status, state, flow_stack, \
          history, revision, state_hash, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(session.id.to_string())
    .bind(&session.user_id)
    .bind(session.current_flow_id.to_string())
    .bind(&session.current_node_id)
    .bind(session.status.encode())
    .bind(serde_json::to_string(&session.state)?)
    .bind(serde_json::to_string(&session.flow_stack)?)
    .bind(serde_json::to_string(&session.history)?)
    .bind(session.revision as i64)
    .bind(&session.state_hash)
    .bind(session.created_at.to_rfc3339())
    .bind(session.updated_at.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

/// Guarded update: affects zero rows when the stored revision moved.
async fn update_session_row<'e, E>(
    executor: E,
    session: &ConversationSession,
    expected_revision: u64,
) -> Result<u64, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        "UPDATE sessions SET user_id = ?, current_flow_id = ?, current_node_id = ?, \
         status = ?, state = ?, flow_stack = ?, history = ?, revision = ?, \
         state_hash = ?, updated_at = ? \
         WHERE id = ? AND revision = ?",
    )
    .bind(&session.user_id)
    .bind(session.current_flow_id.to_string())
    .bind(&session.current_node_id)
    .bind(session.status.encode())
    .bind(serde_json::to_string(&session.state)?)
    .bind(serde_json::to_string(&session.flow_stack)?)
    .bind(serde_json::to_string(&session.history)?)
    .bind(session.revision as i64)
    .bind(&session.state_hash)
    .bind(session.updated_at.to_rfc3339())
    .bind(session.id.to_string())
    .bind(expected_revision as i64)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

impl SqliteStore {
    async fn save_conflict(
        &self,
        session: &ConversationSession,
        expected_revision: u64,
    ) -> StoreError {
        let actual: Result<Option<i64>, sqlx::Error> =
            sqlx::query_scalar("SELECT revision FROM sessions WHERE id = ?")
                .bind(session.id.to_string())
                .fetch_optional(&self.pool)
                .await;
        match actual {
            Ok(Some(actual)) => StoreError::RevisionConflict {
                session_id: session.id,
                expected: expected_revision,
                actual: actual as u64,
            },
            Ok(None) => StoreError::session_not_found(session.id),
            Err(e) => StoreError::from(e),
        }
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create(&self, session: &ConversationSession) -> Result<(), StoreError> {
        insert_session_row(&self.pool, session).await
    }

    async fn load(&self, id: Uuid) -> Result<Option<ConversationSession>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(ConversationSession::try_from).transpose()
    }

    async fn save(
        &self,
        session: &ConversationSession,
        expected_revision: u64,
    ) -> Result<(), StoreError> {
        if update_session_row(&self.pool, session, expected_revision).await? == 0 {
            return Err(self.save_conflict(session, expected_revision).await);
        }
        Ok(())
    }

    async fn create_with_events(
        &self,
        session: &ConversationSession,
        events: Vec<NewOutboxEvent>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_session_row(&mut *tx, session).await?;
        for event in events {
            insert_outbox_row(&mut *tx, &event.into_event()).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn save_with_events(
        &self,
        session: &ConversationSession,
        expected_revision: u64,
        events: Vec<NewOutboxEvent>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        if update_session_row(&mut *tx, session, expected_revision).await? == 0 {
            tx.rollback().await?;
            return Err(self.save_conflict(session, expected_revision).await);
        }
        for event in events {
            insert_outbox_row(&mut *tx, &event.into_event()).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn expire_idle(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "UPDATE sessions SET status = 'EXPIRED', revision = revision + 1, updated_at = ? \
             WHERE status IN ('ACTIVE', 'WAITING_FOR_INPUT') AND updated_at <= ? \
             RETURNING id",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|(id,)| parse_uuid(id, "session id"))
            .collect()
    }
}

#[async_trait]
impl IdempotencyLedger for SqliteStore {
    async fn begin(&self, key: &str) -> Result<BeginOutcome, StoreError> {
        let now = Utc::now();
        let now_s = now.to_rfc3339();
        let hold_until = (now + self.ledger_processing_expiry).to_rfc3339();
        // Conditional insert: exactly one of N racers gets a row in.
        let inserted = sqlx::query(
            "INSERT INTO idempotency (key, status, expires_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT(key) DO NOTHING",
        )
        .bind(key)
        .bind(IdempotencyStatus::Processing.encode())
        .bind(&hold_until)
        .bind(&now_s)
        .bind(&now_s)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 1 {
            return Ok(BeginOutcome::Acquired);
        }

        let row = sqlx::query("SELECT status, result FROM idempotency WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        let status: String = row.try_get("status")?;
        match IdempotencyStatus::decode(&status)
            .ok_or_else(|| corrupt("idempotency status", &status))?
        {
            IdempotencyStatus::Completed => {
                let result: Option<String> = row.try_get("result")?;
                let result = result.map(|s| serde_json::from_str(&s)).transpose()?;
                Ok(BeginOutcome::AlreadyDone(result))
            }
            IdempotencyStatus::Processing => {
                // A hold past its expiry belongs to a dead worker.
                // Reclaim it with the same racer guard as FAILED keys.
                let reclaimed = sqlx::query(
                    "UPDATE idempotency SET expires_at = ?, updated_at = ? \
                     WHERE key = ? AND status = ? AND expires_at <= ?",
                )
                .bind(&hold_until)
                .bind(&now_s)
                .bind(key)
                .bind(IdempotencyStatus::Processing.encode())
                .bind(&now_s)
                .execute(&self.pool)
                .await?;
                if reclaimed.rows_affected() == 1 {
                    Ok(BeginOutcome::Acquired)
                } else {
                    Ok(BeginOutcome::InFlight)
                }
            }
            IdempotencyStatus::Failed => {
                // Reclaim failed keys, guarding against a racer doing
                // the same.
                let reclaimed = sqlx::query(
                    "UPDATE idempotency SET status = ?, error = NULL, expires_at = ?, \
                     updated_at = ? WHERE key = ? AND status = ?",
                )
                .bind(IdempotencyStatus::Processing.encode())
                .bind(&hold_until)
                .bind(&now_s)
                .bind(key)
                .bind(IdempotencyStatus::Failed.encode())
                .execute(&self.pool)
                .await?;
                if reclaimed.rows_affected() == 1 {
                    Ok(BeginOutcome::Acquired)
                } else {
                    Ok(BeginOutcome::InFlight)
                }
            }
        }
    }

    async fn complete(&self, key: &str, result: Option<Value>) -> Result<(), StoreError> {
        let result = result.map(|v| v.to_string());
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE idempotency SET status = ?, result = ?, expires_at = ?, updated_at = ? \
             WHERE key = ?",
        )
        .bind(IdempotencyStatus::Completed.encode())
        .bind(result)
        .bind((now + self.ledger_record_retention).to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(key)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "idempotency key",
                id: key.to_string(),
            });
        }
        Ok(())
    }

    async fn fail(&self, key: &str, error: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE idempotency SET status = ?, error = ?, expires_at = ?, updated_at = ? \
             WHERE key = ?",
        )
        .bind(IdempotencyStatus::Failed.encode())
        .bind(error)
        .bind((now + self.ledger_record_retention).to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(key)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "idempotency key",
                id: key.to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM idempotency WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let status: String = row.try_get("status")?;
        let result: Option<String> = row.try_get("result")?;
        let expires_at: String = row.try_get("expires_at")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        Ok(Some(IdempotencyRecord {
            key: row.try_get("key")?,
            status: IdempotencyStatus::decode(&status)
                .ok_or_else(|| corrupt("idempotency status", &status))?,
            result: result.map(|s| serde_json::from_str(&s)).transpose()?,
            error: row.try_get("error")?,
            expires_at: parse_time(&expires_at, "idempotency expires_at")?,
            created_at: parse_time(&created_at, "idempotency created_at")?,
            updated_at: parse_time(&updated_at, "idempotency updated_at")?,
        }))
    }

    async fn reap_expired(&self) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM idempotency WHERE expires_at <= ?")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected())
    }
}

#[derive(FromRow)]
struct OutboxRow {
    id: String,
    event_type: String,
    destination: String,
    payload: String,
    status: String,
    priority: i64,
    retry_count: i64,
    max_retries: i64,
    next_retry_at: Option<String>,
    last_error: Option<String>,
    claimed_at: Option<String>,
    delivered_at: Option<String>,
    session_id: Option<String>,
    flow_id: Option<String>,
    user_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, StoreError> {
        Ok(OutboxEvent {
            id: parse_uuid(&row.id, "outbox id")?,
            event_type: row.event_type,
            destination: row.destination,
            payload: serde_json::from_str(&row.payload)?,
            status: OutboxStatus::decode(&row.status)
                .ok_or_else(|| corrupt("outbox status", &row.status))?,
            priority: row.priority as i32,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            next_retry_at: parse_opt_time(row.next_retry_at.as_deref(), "outbox next_retry_at")?,
            last_error: row.last_error,
            claimed_at: parse_opt_time(row.claimed_at.as_deref(), "outbox claimed_at")?,
            delivered_at: parse_opt_time(row.delivered_at.as_deref(), "outbox delivered_at")?,
            session_id: row
                .session_id
                .as_deref()
                .map(|s| parse_uuid(s, "outbox session id"))
                .transpose()?,
            flow_id: row
                .flow_id
                .as_deref()
                .map(|s| parse_uuid(s, "outbox flow id"))
                .transpose()?,
            user_id: row.user_id,
            created_at: parse_time(&row.created_at, "outbox created_at")?,
            updated_at: parse_time(&row.updated_at, "outbox updated_at")?,
        })
    }
}

async fn insert_outbox_row<'e, E>(executor: E, row: &OutboxEvent) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO outbox \
         (id, event_type, destination, payload, status, priority, retry_count, \
          max_retries, next_retry_at, last_error, claimed_at, delivered_at, \
          session_id, flow_id, user_id, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, NULL, ?, ?, ?, ?, ?)",
    )
    .bind(row.id.to_string())
    .bind(&row.event_type)
    .bind(&row.destination)
    .bind(row.payload.to_string())
    .bind(row.status.encode())
    .bind(row.priority as i64)
    .bind(row.retry_count as i64)
    .bind(row.max_retries as i64)
    .bind(row.session_id.map(|id| id.to_string()))
    .bind(row.flow_id.map(|id| id.to_string()))
    .bind(&row.user_id)
    .bind(row.created_at.to_rfc3339())
    .bind(row.updated_at.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn insert(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError> {
        let row = event.into_event();
        insert_outbox_row(&self.pool, &row).await?;
        Ok(row)
    }

    async fn claim_batch(
        &self,
        limit: usize,
        stale_after: Duration,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let now = Utc::now();
        let now_s = now.to_rfc3339();
        let stale_cutoff = (now - stale_after).to_rfc3339();

        let mut tx = self.pool.begin().await?;
        let rows: Vec<OutboxRow> = sqlx::query_as(
            "SELECT * FROM outbox WHERE \
               (status = 'PENDING' AND (next_retry_at IS NULL OR next_retry_at <= ?)) \
               OR (status = 'FAILED' AND (next_retry_at IS NULL OR next_retry_at <= ?)) \
               OR (status = 'PROCESSING' AND claimed_at IS NOT NULL AND claimed_at <= ?) \
             ORDER BY priority DESC, created_at ASC LIMIT ?",
        )
        .bind(&now_s)
        .bind(&now_s)
        .bind(&stale_cutoff)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            sqlx::query(
                "UPDATE outbox SET status = 'PROCESSING', claimed_at = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(&now_s)
            .bind(&now_s)
            .bind(&row.id)
            .execute(&mut *tx)
            .await?;
            let mut event = OutboxEvent::try_from(row)?;
            event.status = OutboxStatus::Processing;
            event.claimed_at = Some(now);
            event.updated_at = now;
            claimed.push(event);
        }
        tx.commit().await?;
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let updated = sqlx::query(
            "UPDATE outbox SET status = 'DELIVERED', delivered_at = ?, claimed_at = NULL, \
             updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        require_row(updated.rows_affected(), id)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE outbox SET status = 'FAILED', retry_count = retry_count + 1, \
             last_error = ?, next_retry_at = ?, claimed_at = NULL, updated_at = ? \
             WHERE id = ?",
        )
        .bind(error)
        .bind(next_retry_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        require_row(updated.rows_affected(), id)
    }

    async fn mark_dead_letter(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE outbox SET status = 'DEAD_LETTER', retry_count = retry_count + 1, \
             last_error = ?, next_retry_at = NULL, claimed_at = NULL, updated_at = ? \
             WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        require_row(updated.rows_affected(), id)
    }

    async fn reset_for_retry(&self, id: Uuid) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE outbox SET status = 'PENDING', retry_count = 0, next_retry_at = NULL, \
             last_error = NULL, claimed_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        require_row(updated.rows_affected(), id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>, StoreError> {
        let row: Option<OutboxRow> = sqlx::query_as("SELECT * FROM outbox WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(OutboxEvent::try_from).transpose()
    }

    async fn list_by_status(&self, status: OutboxStatus) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows: Vec<OutboxRow> =
            sqlx::query_as("SELECT * FROM outbox WHERE status = ? ORDER BY created_at ASC")
                .bind(status.encode())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(OutboxEvent::try_from).collect()
    }
}

fn require_row(rows_affected: u64, id: Uuid) -> Result<(), StoreError> {
    if rows_affected == 0 {
        Err(StoreError::NotFound {
            kind: "outbox event",
            id: id.to_string(),
        })
    } else {
        Ok(())
    }
}
