//! Delivery adapters and the destination router.
//!
//! An outbox destination is `"{scheme}:{target}"`; the router strips
//! the scheme prefix and hands the target to the registered adapter:
//!
//! - `webhook:` posts the payload to a subscribed HTTP endpoint,
//!   signed and guarded by a per-endpoint circuit breaker
//! - `slack:` posts a text message to a Slack incoming-webhook URL
//! - `email:` renders the payload through an injected [`Mailer`]
//! - `internal:` invokes a registered in-process handler
//!
//! Destinations without a registered adapter are a
//! [`DeliveryError::NoAdapter`], which the sweeper counts as skipped
//! rather than failed.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::outbox::OutboxEvent;

#[cfg(feature = "delivery-http")]
use hmac::{Hmac, Mac};
#[cfg(feature = "delivery-http")]
use sha2::Sha256;

#[cfg(feature = "delivery-http")]
use crate::breaker::{BreakerError, BreakerRegistry};

/// Errors raised while delivering one event.
#[derive(Debug, Error, Diagnostic)]
pub enum DeliveryError {
    /// No adapter is registered for the destination scheme.
    #[error("no adapter for destination scheme '{scheme}'")]
    #[diagnostic(
        code(chatloom::delivery::no_adapter),
        help("Register an adapter for this scheme on the router.")
    )]
    NoAdapter { scheme: String },

    #[error("destination '{destination}' has no scheme prefix")]
    #[diagnostic(code(chatloom::delivery::bad_destination))]
    BadDestination { destination: String },

    /// The endpoint answered with a non-success status.
    #[error("endpoint rejected delivery: {message}")]
    #[diagnostic(code(chatloom::delivery::rejected))]
    Rejected { message: String },

    /// Transport-level failure (connect, timeout, circuit open).
    #[error("transport failure: {message}")]
    #[diagnostic(code(chatloom::delivery::transport))]
    Transport { message: String },

    #[error("internal handler '{name}' failed: {message}")]
    #[diagnostic(code(chatloom::delivery::handler))]
    Handler { name: String, message: String },

    #[error("unknown webhook subscription '{id}'")]
    #[diagnostic(code(chatloom::delivery::unknown_subscription))]
    UnknownSubscription { id: String },
}

/// A destination adapter for one scheme.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    /// Scheme prefix this adapter serves, without the colon.
    fn scheme(&self) -> &'static str;

    /// Deliver one event to `target` (the destination minus its
    /// scheme prefix).
    async fn deliver(&self, target: &str, event: &OutboxEvent) -> Result<(), DeliveryError>;
}

/// Routes outbox events to adapters by destination scheme.
#[derive(Default)]
pub struct DeliveryRouter {
    adapters: FxHashMap<&'static str, Arc<dyn DeliveryAdapter>>,
}

impl DeliveryRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn DeliveryAdapter>) -> Self {
        self.adapters.insert(adapter.scheme(), adapter);
        self
    }

    pub fn register(&mut self, adapter: Arc<dyn DeliveryAdapter>) {
        self.adapters.insert(adapter.scheme(), adapter);
    }

    /// Split a destination into scheme and target.
    pub fn split(destination: &str) -> Result<(&str, &str), DeliveryError> {
        destination
            .split_once(':')
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| DeliveryError::BadDestination {
                destination: destination.to_string(),
            })
    }

    /// Deliver one event through the adapter its destination names.
    pub async fn deliver(&self, event: &OutboxEvent) -> Result<(), DeliveryError> {
        let (scheme, target) = Self::split(&event.destination)?;
        let adapter = self
            .adapters
            .get(scheme)
            .ok_or_else(|| DeliveryError::NoAdapter {
                scheme: scheme.to_string(),
            })?;
        adapter.deliver(target, event).await
    }
}

/// A registered webhook receiver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub url: String,
    /// HMAC secret for the `X-Webhook-Signature` header, when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Event types this receiver wants; `"*"` matches everything.
    pub event_types: Vec<String>,
    /// Extra headers sent with every post to this receiver.
    #[serde(default)]
    pub headers: FxHashMap<String, String>,
    /// Per-request timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub active: bool,
}

impl WebhookSubscription {
    #[must_use]
    pub fn accepts(&self, event_type: &str) -> bool {
        self.active
            && self
                .event_types
                .iter()
                .any(|t| t == "*" || t == event_type)
    }
}

/// Hex HMAC-SHA256 signature header value for a payload body.
///
/// `None` only if the key is unusable, which HMAC-SHA256 never reports
/// for any length.
#[cfg(feature = "delivery-http")]
#[must_use]
pub fn sign_payload(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!(
        "sha256={}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Posts signed JSON payloads to subscribed HTTP endpoints.
///
/// The target is either a subscription id (looked up in the
/// subscription set, honoring its event-type filter) or a literal
/// `http(s)` URL delivered unsigned. Every endpoint call goes through
/// the per-endpoint circuit breaker.
#[cfg(feature = "delivery-http")]
pub struct WebhookAdapter {
    client: reqwest::Client,
    breakers: BreakerRegistry,
    subscriptions: Mutex<FxHashMap<Uuid, WebhookSubscription>>,
}

#[cfg(feature = "delivery-http")]
impl WebhookAdapter {
    #[must_use]
    pub fn new(client: reqwest::Client, breakers: BreakerRegistry) -> Self {
        Self {
            client,
            breakers,
            subscriptions: Mutex::new(FxHashMap::default()),
        }
    }

    pub async fn subscribe(&self, subscription: WebhookSubscription) {
        let mut subs = self.subscriptions.lock().await;
        subs.insert(subscription.id, subscription);
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        let mut subs = self.subscriptions.lock().await;
        subs.remove(&id);
    }

    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        signature: Option<String>,
        headers: FxHashMap<String, String>,
        timeout: Option<std::time::Duration>,
    ) -> Result<(), DeliveryError> {
        let breaker = self.breakers.breaker(url).await;
        let client = self.client.clone();
        let url_owned = url.to_string();
        let result = breaker
            .call(|| async move {
                let mut request = client
                    .post(&url_owned)
                    .header("content-type", "application/json")
                    .body(body);
                for (name, value) in &headers {
                    request = request.header(name, value);
                }
                if let Some(timeout) = timeout {
                    request = request.timeout(timeout);
                }
                if let Some(signature) = signature {
                    request = request.header("X-Webhook-Signature", signature);
                }
                let response = request.send().await.map_err(|e| e.to_string())?;
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(format!("status {status}"))
                }
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(BreakerError::Open { endpoint }) => Err(DeliveryError::Transport {
                message: format!("circuit open for {endpoint}"),
            }),
            Err(BreakerError::Call { message }) => Err(DeliveryError::Rejected { message }),
        }
    }
}

#[cfg(feature = "delivery-http")]
#[async_trait]
impl DeliveryAdapter for WebhookAdapter {
    fn scheme(&self) -> &'static str {
        "webhook"
    }

    #[tracing::instrument(skip(self, event), fields(event_id = %event.id))]
    async fn deliver(&self, target: &str, event: &OutboxEvent) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(&event.payload).map_err(|e| DeliveryError::Transport {
            message: e.to_string(),
        })?;

        if target.starts_with("http://") || target.starts_with("https://") {
            return self
                .post(target, body, None, FxHashMap::default(), None)
                .await;
        }

        let id = target
            .parse::<Uuid>()
            .map_err(|_| DeliveryError::BadDestination {
                destination: format!("webhook:{target}"),
            })?;
        let subscription = {
            let subs = self.subscriptions.lock().await;
            subs.get(&id)
                .cloned()
                .ok_or_else(|| DeliveryError::UnknownSubscription {
                    id: id.to_string(),
                })?
        };
        if !subscription.accepts(&event.event_type) {
            tracing::debug!(
                subscription = %id,
                event_type = %event.event_type,
                "subscription filtered event, skipping post"
            );
            return Ok(());
        }
        let signature = subscription
            .secret
            .as_deref()
            .and_then(|secret| sign_payload(secret, &body));
        let timeout = subscription
            .timeout_secs
            .map(std::time::Duration::from_secs);
        let WebhookSubscription { url, headers, .. } = subscription;
        self.post(&url, body, signature, headers, timeout).await
    }
}

/// Posts plain-text notifications to Slack incoming webhooks.
///
/// The target is the incoming-webhook URL; the message text is the
/// payload's `text` field, falling back to the event type.
#[cfg(feature = "delivery-http")]
pub struct SlackAdapter {
    client: reqwest::Client,
    breakers: BreakerRegistry,
}

#[cfg(feature = "delivery-http")]
impl SlackAdapter {
    #[must_use]
    pub fn new(client: reqwest::Client, breakers: BreakerRegistry) -> Self {
        Self { client, breakers }
    }
}

#[cfg(feature = "delivery-http")]
#[async_trait]
impl DeliveryAdapter for SlackAdapter {
    fn scheme(&self) -> &'static str {
        "slack"
    }

    async fn deliver(&self, target: &str, event: &OutboxEvent) -> Result<(), DeliveryError> {
        let text = event
            .payload
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| event.event_type.clone());
        let body = serde_json::json!({ "text": text });

        let breaker = self.breakers.breaker(target).await;
        let client = self.client.clone();
        let url = target.to_string();
        breaker
            .call(|| async move {
                let response = client
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(format!("status {status}"))
                }
            })
            .await
            .map_err(|e| match e {
                BreakerError::Open { endpoint } => DeliveryError::Transport {
                    message: format!("circuit open for {endpoint}"),
                },
                BreakerError::Call { message } => DeliveryError::Rejected { message },
            })
    }
}

/// Outbound mail seam; production wires an SMTP or API client, tests
/// wire a recorder.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), String>;
}

/// Renders outbox payloads as mail through an injected [`Mailer`].
///
/// The target is the recipient address. Subject and body come from the
/// payload's `subject`/`body` fields, with the event type and compact
/// payload JSON as fallbacks.
pub struct EmailAdapter {
    mailer: Arc<dyn Mailer>,
}

impl EmailAdapter {
    #[must_use]
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl DeliveryAdapter for EmailAdapter {
    fn scheme(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, target: &str, event: &OutboxEvent) -> Result<(), DeliveryError> {
        let subject = event
            .payload
            .get("subject")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| event.event_type.clone());
        let body = event
            .payload
            .get("body")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| event.payload.to_string());
        self.mailer
            .send(target, &subject, &body)
            .await
            .map_err(|message| DeliveryError::Rejected { message })
    }
}

/// An in-process event handler invoked for `internal:` destinations.
pub type InternalHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Dispatches events to named in-process handlers.
#[derive(Default)]
pub struct InternalAdapter {
    handlers: Mutex<FxHashMap<String, InternalHandler>>,
}

impl InternalAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a name. Replaces any existing handler
    /// with the same name.
    pub async fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock().await;
        handlers.insert(name.into(), Arc::new(handler));
    }
}

#[async_trait]
impl DeliveryAdapter for InternalAdapter {
    fn scheme(&self) -> &'static str {
        "internal"
    }

    async fn deliver(&self, target: &str, event: &OutboxEvent) -> Result<(), DeliveryError> {
        let handler = {
            let handlers = self.handlers.lock().await;
            handlers.get(target).cloned()
        };
        let handler = handler.ok_or_else(|| DeliveryError::Handler {
            name: target.to_string(),
            message: "no such handler".to_string(),
        })?;
        handler(event.payload.clone())
            .await
            .map(|_| ())
            .map_err(|message| DeliveryError::Handler {
                name: target.to_string(),
                message,
            })
    }
}
