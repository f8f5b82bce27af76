mod common;

use std::sync::Arc;

use chatloom::state::ConversationSession;
use chatloom::store::{
    BeginOutcome, IdempotencyLedger, InMemoryIdempotencyLedger, InMemorySessionStore,
    SessionStore, StoreError,
};
use chatloom::types::SessionStatus;
use common::{harness, question_flow};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn every_successful_mutation_bumps_revision_by_one() {
    let flow = question_flow();
    let flow_id = flow.id;
    let h = harness(vec![flow]).await;

    let started = h.runtime.start_session(flow_id, None, None).await.unwrap();
    // create at 1, question processed and paused -> one bump.
    assert_eq!(started.revision, 2);

    let reply = h
        .runtime
        .interact(started.session_id, json!("tea"))
        .await
        .unwrap();
    assert_eq!(reply.status, SessionStatus::Completed);
    assert!(reply.revision > started.revision);

    let session = h.sessions.load(started.session_id).await.unwrap().unwrap();
    assert_eq!(session.revision, reply.revision);
}

#[tokio::test]
async fn stale_save_is_a_revision_conflict_and_changes_nothing() {
    let store = InMemorySessionStore::new();
    let mut session = ConversationSession::new(Uuid::new_v4(), "entry", None);
    store.create(&session).await.unwrap();

    // First writer wins.
    let expected = session.revision;
    session.state.set("temp.x", json!(1)).unwrap();
    session.touch();
    store.save(&session, expected).await.unwrap();

    // Second writer replays against the old revision.
    let mut stale = store.load(session.id).await.unwrap().unwrap();
    stale.state.set("temp.x", json!(999)).unwrap();
    stale.touch();
    let err = store.save(&stale, expected).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::RevisionConflict {
            expected: 1,
            actual: 2,
            ..
        }
    ));

    let current = store.load(session.id).await.unwrap().unwrap();
    assert_eq!(current.state.get("temp.x"), Some(&json!(1)));
    assert_eq!(current.revision, 2);
}

#[tokio::test]
async fn n_way_begin_race_yields_exactly_one_acquisition() {
    let ledger = Arc::new(InMemoryIdempotencyLedger::new());
    let key = "session:node:7";

    let mut handles = Vec::new();
    for _ in 0..32 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move { ledger.begin(key).await.unwrap() }));
    }

    let mut acquired = 0;
    let mut in_flight = 0;
    for handle in handles {
        match handle.await.unwrap() {
            BeginOutcome::Acquired => acquired += 1,
            BeginOutcome::InFlight => in_flight += 1,
            BeginOutcome::AlreadyDone(_) => panic!("nothing completed yet"),
        }
    }
    assert_eq!(acquired, 1);
    assert_eq!(in_flight, 31);
}

#[tokio::test]
async fn expired_processing_hold_is_reclaimed_not_in_flight() {
    // A zero expiry models a worker that died holding the key.
    let ledger = InMemoryIdempotencyLedger::new()
        .with_expiry(chrono::Duration::zero(), chrono::Duration::days(1));
    assert!(matches!(
        ledger.begin("k").await.unwrap(),
        BeginOutcome::Acquired
    ));

    // The hold lapsed immediately, so the next caller takes over
    // instead of waiting forever on InFlight.
    assert!(matches!(
        ledger.begin("k").await.unwrap(),
        BeginOutcome::Acquired
    ));
}

#[tokio::test]
async fn reaping_removes_terminal_records_past_retention() {
    let ledger = InMemoryIdempotencyLedger::new()
        .with_expiry(chrono::Duration::days(1), chrono::Duration::zero());
    assert!(matches!(
        ledger.begin("done").await.unwrap(),
        BeginOutcome::Acquired
    ));
    ledger.complete("done", None).await.unwrap();
    assert!(matches!(
        ledger.begin("held").await.unwrap(),
        BeginOutcome::Acquired
    ));

    let removed = ledger.reap_expired().await.unwrap();
    assert_eq!(removed, 1);
    assert!(ledger.get("done").await.unwrap().is_none());
    // The live PROCESSING hold survives the sweep.
    assert!(ledger.get("held").await.unwrap().is_some());
}

#[tokio::test]
async fn completed_key_replays_its_stored_result() {
    let ledger = InMemoryIdempotencyLedger::new();
    assert!(matches!(
        ledger.begin("k").await.unwrap(),
        BeginOutcome::Acquired
    ));
    ledger
        .complete("k", Some(json!({"answer": 42})))
        .await
        .unwrap();

    match ledger.begin("k").await.unwrap() {
        BeginOutcome::AlreadyDone(result) => {
            assert_eq!(result, Some(json!({"answer": 42})));
        }
        other => panic!("expected AlreadyDone, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_key_can_be_reclaimed() {
    let ledger = InMemoryIdempotencyLedger::new();
    assert!(matches!(
        ledger.begin("k").await.unwrap(),
        BeginOutcome::Acquired
    ));
    ledger.fail("k", "boom").await.unwrap();

    assert!(matches!(
        ledger.begin("k").await.unwrap(),
        BeginOutcome::Acquired
    ));
    let record = ledger.get("k").await.unwrap().unwrap();
    assert!(record.error.is_none());
}
