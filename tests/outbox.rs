use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use chatloom::config::OutboxConfig;
use chatloom::outbox::delivery::{DeliveryAdapter, DeliveryError, DeliveryRouter};
use chatloom::outbox::service::OutboxService;
use chatloom::outbox::{NewOutboxEvent, OutboxEvent, priority};
use chatloom::store::{InMemoryOutboxStore, OutboxStore};
use chatloom::types::OutboxStatus;
use serde_json::json;

/// Test adapter recording delivery order, optionally failing the first
/// N attempts per target.
struct ScriptedAdapter {
    delivered: Arc<Mutex<Vec<String>>>,
    failures_remaining: Arc<Mutex<usize>>,
}

impl ScriptedAdapter {
    fn new(failures: usize) -> (Self, Arc<Mutex<Vec<String>>>) {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                delivered: delivered.clone(),
                failures_remaining: Arc::new(Mutex::new(failures)),
            },
            delivered,
        )
    }
}

#[async_trait]
impl DeliveryAdapter for ScriptedAdapter {
    fn scheme(&self) -> &'static str {
        "test"
    }

    async fn deliver(&self, target: &str, _event: &OutboxEvent) -> Result<(), DeliveryError> {
        {
            let mut remaining = self.failures_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DeliveryError::Rejected {
                    message: "scripted failure".to_string(),
                });
            }
        }
        self.delivered.lock().unwrap().push(target.to_string());
        Ok(())
    }
}

fn service(
    store: Arc<InMemoryOutboxStore>,
    adapter: ScriptedAdapter,
    config: OutboxConfig,
) -> OutboxService {
    let router = Arc::new(DeliveryRouter::new().with_adapter(Arc::new(adapter)));
    OutboxService::new(store, router).with_config(config)
}

/// Zero-delay retries so failed events are immediately claimable again.
fn immediate_retry_config() -> OutboxConfig {
    OutboxConfig {
        retry_delays_secs: vec![0],
        ..OutboxConfig::default()
    }
}

#[tokio::test]
async fn sweep_delivers_by_priority_then_age() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let (adapter, delivered) = ScriptedAdapter::new(0);
    let svc = service(store.clone(), adapter, OutboxConfig::default());

    svc.publish(NewOutboxEvent::new("e", "test:normal-old", json!({})))
        .await
        .unwrap();
    svc.publish(NewOutboxEvent::new("e", "test:critical", json!({})).priority(priority::CRITICAL))
        .await
        .unwrap();
    svc.publish(NewOutboxEvent::new("e", "test:high", json!({})).priority(priority::HIGH))
        .await
        .unwrap();
    svc.publish(NewOutboxEvent::new("e", "test:low", json!({})).priority(priority::LOW))
        .await
        .unwrap();
    svc.publish(NewOutboxEvent::new("e", "test:normal-new", json!({})))
        .await
        .unwrap();

    let stats = svc.sweep().await.unwrap();
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.succeeded, 5);
    assert_eq!(
        delivered.lock().unwrap().clone(),
        vec!["critical", "high", "normal-old", "normal-new", "low"]
    );
}

#[tokio::test]
async fn failed_delivery_is_rescheduled_then_succeeds() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let (adapter, delivered) = ScriptedAdapter::new(1);
    let svc = service(store.clone(), adapter, immediate_retry_config());

    let event = svc
        .publish(NewOutboxEvent::new("e", "test:x", json!({})))
        .await
        .unwrap();

    let first = svc.sweep().await.unwrap();
    assert_eq!(first.failed, 1);
    let row = store.get(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.retry_count, 1);
    assert!(row.last_error.is_some());

    let second = svc.sweep().await.unwrap();
    assert_eq!(second.succeeded, 1);
    let row = store.get(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Delivered);
    assert!(row.delivered_at.is_some());
    assert_eq!(delivered.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn event_dead_letters_after_exhausting_its_budget() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let (adapter, _) = ScriptedAdapter::new(usize::MAX);
    let svc = service(store.clone(), adapter, immediate_retry_config());

    let event = svc
        .publish(NewOutboxEvent::new("e", "test:x", json!({})).max_retries(2))
        .await
        .unwrap();

    // Attempts 1..=2 reschedule, attempt 3 exceeds max_retries = 2.
    for _ in 0..2 {
        let stats = svc.sweep().await.unwrap();
        assert_eq!(stats.failed, 1);
    }
    let stats = svc.sweep().await.unwrap();
    assert_eq!(stats.dead_lettered, 1);

    let row = store.get(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::DeadLetter);
    assert_eq!(row.retry_count, 3);

    // Dead letters are not claimed again.
    let stats = svc.sweep().await.unwrap();
    assert_eq!(stats.processed, 0);
}

#[tokio::test]
async fn manual_retry_redelivers_a_dead_letter() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let (adapter, delivered) = ScriptedAdapter::new(4);
    let svc = service(store.clone(), adapter, immediate_retry_config());

    let event = svc
        .publish(NewOutboxEvent::new("e", "test:revive", json!({})).max_retries(2))
        .await
        .unwrap();
    for _ in 0..3 {
        svc.sweep().await.unwrap();
    }
    assert_eq!(svc.dead_letters().await.unwrap().len(), 1);

    svc.retry_event(event.id).await.unwrap();
    let row = store.get(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
    assert_eq!(row.retry_count, 0);

    // One scripted failure remains, then it goes through.
    let stats = svc.sweep().await.unwrap();
    assert_eq!(stats.failed, 1);
    let stats = svc.sweep().await.unwrap();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(delivered.lock().unwrap().clone(), vec!["revive"]);
}

#[tokio::test]
async fn retry_of_a_delivered_event_is_rejected() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let (adapter, _) = ScriptedAdapter::new(0);
    let svc = service(store.clone(), adapter, OutboxConfig::default());

    let event = svc
        .publish(NewOutboxEvent::new("e", "test:x", json!({})))
        .await
        .unwrap();
    svc.sweep().await.unwrap();
    assert!(svc.retry_event(event.id).await.is_err());
}

#[tokio::test]
async fn unroutable_destination_is_skipped_and_parked() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let (adapter, _) = ScriptedAdapter::new(0);
    let svc = service(store.clone(), adapter, OutboxConfig::default());

    let event = svc
        .publish(NewOutboxEvent::new("e", "nowhere:x", json!({})))
        .await
        .unwrap();
    let stats = svc.sweep().await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.failed, 0);

    let row = store.get(event.id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::DeadLetter);
}

#[tokio::test]
async fn batch_size_caps_one_sweep() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let (adapter, _) = ScriptedAdapter::new(0);
    let svc = service(
        store.clone(),
        adapter,
        OutboxConfig {
            batch_size: 2,
            ..OutboxConfig::default()
        },
    );

    for i in 0..5 {
        svc.publish(NewOutboxEvent::new("e", format!("test:{i}"), json!({})))
            .await
            .unwrap();
    }
    assert_eq!(svc.sweep().await.unwrap().processed, 2);
    assert_eq!(svc.sweep().await.unwrap().processed, 2);
    assert_eq!(svc.sweep().await.unwrap().processed, 1);
}
