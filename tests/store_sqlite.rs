#![cfg(feature = "sqlite")]

use chatloom::outbox::NewOutboxEvent;
use chatloom::state::ConversationSession;
use chatloom::store::{
    BeginOutcome, IdempotencyLedger, OutboxStore, SessionStore, StoreError,
};
use chatloom::store_sqlite::SqliteStore;
use chatloom::types::{OutboxStatus, SessionStatus};
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

async fn store() -> (SqliteStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chatloom-test.db");
    let store = SqliteStore::connect(path.to_str().unwrap()).await.unwrap();
    (store, dir)
}

#[tokio::test]
async fn session_round_trips_through_rows() {
    let (store, _dir) = store().await;
    let mut session = ConversationSession::new(Uuid::new_v4(), "entry", Some("u-1".to_string()));
    session.state.set("temp.greeting", json!("hi")).unwrap();
    store.create(&session).await.unwrap();

    let loaded = store.load(session.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, session.id);
    assert_eq!(loaded.user_id, Some("u-1".to_string()));
    assert_eq!(loaded.current_node_id, Some("entry".to_string()));
    assert_eq!(loaded.state.get("temp.greeting"), Some(&json!("hi")));
    assert_eq!(loaded.revision, 1);
    assert_eq!(loaded.state_hash, session.state_hash);
}

#[tokio::test]
async fn save_enforces_the_expected_revision() {
    let (store, _dir) = store().await;
    let mut session = ConversationSession::new(Uuid::new_v4(), "entry", None);
    store.create(&session).await.unwrap();

    let expected = session.revision;
    session.state.set("temp.x", json!(1)).unwrap();
    session.touch();
    store.save(&session, expected).await.unwrap();

    // Replaying against the consumed revision conflicts.
    let err = store.save(&session, expected).await.unwrap_err();
    assert!(matches!(err, StoreError::RevisionConflict { actual: 2, .. }));

    let loaded = store.load(session.id).await.unwrap().unwrap();
    assert_eq!(loaded.revision, 2);
}

#[tokio::test]
async fn save_of_an_unknown_session_is_not_found() {
    let (store, _dir) = store().await;
    let session = ConversationSession::new(Uuid::new_v4(), "entry", None);
    let err = store.save(&session, 1).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[tokio::test]
async fn create_with_events_lands_the_session_and_its_events() {
    let (store, _dir) = store().await;
    let session = ConversationSession::new(Uuid::new_v4(), "entry", None);
    store
        .create_with_events(
            &session,
            vec![NewOutboxEvent::new("session.started", "test:x", json!({}))],
        )
        .await
        .unwrap();

    assert!(store.load(session.id).await.unwrap().is_some());
    let pending = store.list_by_status(OutboxStatus::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event_type, "session.started");
}

#[tokio::test]
async fn save_with_events_commits_both_or_neither() {
    let (store, _dir) = store().await;
    let mut session = ConversationSession::new(Uuid::new_v4(), "entry", None);
    store.create(&session).await.unwrap();

    // A stale revision writes neither the session nor the events.
    let err = store
        .save_with_events(
            &session,
            99,
            vec![NewOutboxEvent::new("node.entered", "test:x", json!({}))],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::RevisionConflict { .. }));
    assert!(
        store
            .list_by_status(OutboxStatus::Pending)
            .await
            .unwrap()
            .is_empty()
    );

    // The expected revision lands both in one transaction.
    let expected = session.revision;
    session.touch();
    store
        .save_with_events(
            &session,
            expected,
            vec![NewOutboxEvent::new("node.entered", "test:x", json!({}))],
        )
        .await
        .unwrap();
    assert_eq!(store.load(session.id).await.unwrap().unwrap().revision, 2);
    assert_eq!(
        store
            .list_by_status(OutboxStatus::Pending)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn idle_sessions_expire_with_a_revision_bump() {
    let (store, _dir) = store().await;
    let waiting = ConversationSession::new(Uuid::new_v4(), "entry", None);
    store.create(&waiting).await.unwrap();
    let mut done = ConversationSession::new(Uuid::new_v4(), "entry", None);
    done.status = SessionStatus::Completed;
    store.create(&done).await.unwrap();

    let expired = store.expire_idle(Utc::now()).await.unwrap();
    assert_eq!(expired, vec![waiting.id]);

    let loaded = store.load(waiting.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, SessionStatus::Expired);
    assert_eq!(loaded.revision, waiting.revision + 1);

    // Terminal rows are left alone.
    let done_row = store.load(done.id).await.unwrap().unwrap();
    assert_eq!(done_row.status, SessionStatus::Completed);
}

#[tokio::test]
async fn ledger_begin_complete_and_replay() {
    let (store, _dir) = store().await;

    assert_eq!(
        store.begin("s:n:1").await.unwrap(),
        BeginOutcome::Acquired
    );
    assert_eq!(
        store.begin("s:n:1").await.unwrap(),
        BeginOutcome::InFlight
    );

    store
        .complete("s:n:1", Some(json!({"status": "COMPLETED"})))
        .await
        .unwrap();
    assert_eq!(
        store.begin("s:n:1").await.unwrap(),
        BeginOutcome::AlreadyDone(Some(json!({"status": "COMPLETED"})))
    );
}

#[tokio::test]
async fn ledger_failed_keys_are_reclaimable() {
    let (store, _dir) = store().await;

    assert_eq!(store.begin("k").await.unwrap(), BeginOutcome::Acquired);
    store.fail("k", "boom").await.unwrap();
    assert_eq!(store.begin("k").await.unwrap(), BeginOutcome::Acquired);

    let record = IdempotencyLedger::get(&store, "k").await.unwrap().unwrap();
    assert!(record.error.is_none());
}

#[tokio::test]
async fn ledger_reclaims_expired_processing_holds() {
    let (store, _dir) = store().await;
    let store = store.with_ledger_expiry(Duration::zero(), Duration::days(1));

    assert_eq!(store.begin("k").await.unwrap(), BeginOutcome::Acquired);
    // The hold lapsed immediately: the next caller takes over instead
    // of seeing InFlight forever.
    assert_eq!(store.begin("k").await.unwrap(), BeginOutcome::Acquired);
}

#[tokio::test]
async fn ledger_reaps_terminal_records_past_retention() {
    let (store, _dir) = store().await;
    let store = store.with_ledger_expiry(Duration::days(1), Duration::zero());

    assert_eq!(store.begin("done").await.unwrap(), BeginOutcome::Acquired);
    store.complete("done", None).await.unwrap();
    assert_eq!(store.begin("held").await.unwrap(), BeginOutcome::Acquired);

    let removed = store.reap_expired().await.unwrap();
    assert_eq!(removed, 1);
    assert!(
        IdempotencyLedger::get(&store, "done")
            .await
            .unwrap()
            .is_none()
    );
    // The live PROCESSING hold survives the sweep.
    assert!(
        IdempotencyLedger::get(&store, "held")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn outbox_claim_orders_by_priority_then_creation() {
    let (store, _dir) = store().await;

    let low = store
        .insert(NewOutboxEvent::new("e", "test:low", json!({})))
        .await
        .unwrap();
    let high = store
        .insert(NewOutboxEvent::new("e", "test:high", json!({})).priority(9))
        .await
        .unwrap();

    let claimed = store.claim_batch(10, Duration::seconds(600)).await.unwrap();
    let ids: Vec<Uuid> = claimed.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![high.id, low.id]);

    // Already claimed rows are invisible to a fresh sweep.
    let again = store.claim_batch(10, Duration::seconds(600)).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn outbox_stale_claims_are_reclaimed() {
    let (store, _dir) = store().await;
    store
        .insert(NewOutboxEvent::new("e", "test:x", json!({})))
        .await
        .unwrap();

    let first = store.claim_batch(10, Duration::seconds(600)).await.unwrap();
    assert_eq!(first.len(), 1);

    // With a zero stale window the claim is immediately reclaimable.
    let reclaimed = store.claim_batch(10, Duration::seconds(0)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, first[0].id);
}

#[tokio::test]
async fn outbox_failure_retry_and_dead_letter_lifecycle() {
    let (store, _dir) = store().await;
    let event = store
        .insert(NewOutboxEvent::new("e", "test:x", json!({})))
        .await
        .unwrap();

    store
        .mark_failed(event.id, "timeout", chrono::Utc::now())
        .await
        .unwrap();
    let row = OutboxStore::get(&store, event.id).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.last_error, Some("timeout".to_string()));

    store.mark_dead_letter(event.id, "gave up").await.unwrap();
    let row = OutboxStore::get(&store, event.id).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 2);
    assert!(row.next_retry_at.is_none());

    store.reset_for_retry(event.id).await.unwrap();
    let row = OutboxStore::get(&store, event.id).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 0);
    assert!(row.last_error.is_none());

    let claimed = store.claim_batch(10, Duration::seconds(600)).await.unwrap();
    assert_eq!(claimed.len(), 1);
    store.mark_delivered(event.id).await.unwrap();
    let row = OutboxStore::get(&store, event.id).await.unwrap().unwrap();
    assert!(row.delivered_at.is_some());
}
