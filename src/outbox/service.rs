//! Outbox sweeper: claims deliverable events and pushes them through
//! the delivery router with retry backoff and dead-lettering.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::event_bus::FlowEvent;
use crate::outbox::delivery::{DeliveryError, DeliveryRouter};
use crate::outbox::{NewOutboxEvent, OutboxEvent, SweepStats};
use crate::store::{OutboxStore, StoreError};
use crate::types::OutboxStatus;

/// Records events and sweeps them to their destinations.
///
/// One sweep claims up to `batch_size` deliverable events (pending,
/// retry-due, or stale-claimed), ordered by priority descending then
/// creation time ascending, and attempts each once. Failures are
/// rescheduled on the backoff ladder until the retry budget runs out,
/// then parked as DEAD_LETTER for manual replay.
pub struct OutboxService {
    store: Arc<dyn OutboxStore>,
    router: Arc<DeliveryRouter>,
    config: OutboxConfig,
    events: Option<flume::Sender<FlowEvent>>,
}

impl OutboxService {
    #[must_use]
    pub fn new(store: Arc<dyn OutboxStore>, router: Arc<DeliveryRouter>) -> Self {
        Self {
            store,
            router,
            config: OutboxConfig::default(),
            events: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: OutboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach an event bus sender; sweeps then emit
    /// [`FlowEvent::OutboxSwept`].
    #[must_use]
    pub fn with_event_sender(mut self, sender: flume::Sender<FlowEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Record a new pending event.
    pub async fn publish(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError> {
        self.store.insert(event).await
    }

    /// Record an event with the configured default retry budget.
    pub async fn publish_with_defaults(
        &self,
        event: NewOutboxEvent,
    ) -> Result<OutboxEvent, StoreError> {
        self.store
            .insert(event.max_retries(self.config.max_retries))
            .await
    }

    /// Run one sweep pass.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepStats, StoreError> {
        let stale_after = Duration::seconds(self.config.stale_claim_secs as i64);
        let batch = self
            .store
            .claim_batch(self.config.batch_size, stale_after)
            .await?;

        let mut stats = SweepStats::default();
        for event in batch {
            stats.processed += 1;
            match self.router.deliver(&event).await {
                Ok(()) => {
                    self.store.mark_delivered(event.id).await?;
                    stats.succeeded += 1;
                }
                // An unroutable destination is a configuration error,
                // not a transient failure: park it rather than burn
                // the retry ladder on it.
                Err(e @ (DeliveryError::NoAdapter { .. } | DeliveryError::BadDestination { .. })) =>
                {
                    tracing::warn!(
                        event_id = %event.id,
                        destination = %event.destination,
                        error = %e,
                        "unroutable outbox event"
                    );
                    self.store.mark_dead_letter(event.id, &e.to_string()).await?;
                    stats.skipped += 1;
                }
                Err(e) => {
                    let attempts = event.retry_count + 1;
                    if attempts > event.max_retries {
                        tracing::error!(
                            event_id = %event.id,
                            destination = %event.destination,
                            attempts,
                            error = %e,
                            "outbox event dead-lettered"
                        );
                        self.store.mark_dead_letter(event.id, &e.to_string()).await?;
                        stats.dead_lettered += 1;
                    } else {
                        let next_retry_at = Utc::now() + self.retry_delay(event.retry_count);
                        tracing::warn!(
                            event_id = %event.id,
                            destination = %event.destination,
                            retry_count = attempts,
                            next_retry_at = %next_retry_at,
                            error = %e,
                            "outbox delivery failed, rescheduled"
                        );
                        self.store
                            .mark_failed(event.id, &e.to_string(), next_retry_at)
                            .await?;
                        stats.failed += 1;
                    }
                }
            }
        }

        if let Some(sender) = &self.events {
            let _ = sender.send(FlowEvent::OutboxSwept {
                processed: stats.processed,
                dead_lettered: stats.dead_lettered,
            });
        }
        Ok(stats)
    }

    /// Manually replay a failed or dead-lettered event: reset to
    /// PENDING with a fresh retry budget. The next sweep picks it up.
    pub async fn retry_event(&self, id: Uuid) -> Result<(), StoreError> {
        let event = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: "outbox event",
                id: id.to_string(),
            })?;
        match event.status {
            OutboxStatus::Failed | OutboxStatus::DeadLetter => {
                self.store.reset_for_retry(id).await
            }
            other => Err(StoreError::Backend {
                message: format!("cannot replay event in status {other}"),
            }),
        }
    }

    /// Dead-lettered events awaiting manual replay.
    pub async fn dead_letters(&self) -> Result<Vec<OutboxEvent>, StoreError> {
        self.store.list_by_status(OutboxStatus::DeadLetter).await
    }

    /// Backoff for the given prior retry count, clamped to the last
    /// ladder entry.
    fn retry_delay(&self, retry_count: u32) -> Duration {
        let ladder = &self.config.retry_delays_secs;
        let secs = ladder
            .get(retry_count as usize)
            .or_else(|| ladder.last())
            .copied()
            .unwrap_or(60);
        Duration::seconds(secs as i64)
    }
}
