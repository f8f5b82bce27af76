//! In-process observability bus for flow lifecycle events.
//!
//! This is the volatile, fire-and-forget counterpart to the durable
//! [`outbox`](crate::outbox): runtime components emit [`FlowEvent`]s
//! here for logging, testing, and live streaming, while externally
//! visible notifications go through the outbox.
//!
//! The bus fans events out from a flume channel to pluggable
//! [`EventSink`]s on a background task.

use std::fmt;
use std::io::{self, Result as IoResult, Write};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::types::SessionStatus;

/// A lifecycle event emitted by the runtime while processing flows.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum FlowEvent {
    SessionStarted {
        session_id: Uuid,
        flow_id: Uuid,
    },
    NodeEntered {
        session_id: Uuid,
        node_id: String,
    },
    StatusChanged {
        session_id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    },
    OutboxSwept {
        processed: usize,
        dead_lettered: usize,
    },
    Diagnostic {
        scope: String,
        message: String,
    },
}

impl FlowEvent {
    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        FlowEvent::Diagnostic {
            scope: scope.into(),
            message: message.into(),
        }
    }

    /// Convert to a normalized JSON value for structured sinks.
    pub fn to_json_value(&self) -> serde_json::Value {
        let timestamp: DateTime<Utc> = Utc::now();
        serde_json::json!({
            "event": self.label(),
            "detail": serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
            "timestamp": timestamp.to_rfc3339(),
        })
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            FlowEvent::SessionStarted { .. } => "session_started",
            FlowEvent::NodeEntered { .. } => "node_entered",
            FlowEvent::StatusChanged { .. } => "session_status_changed",
            FlowEvent::OutboxSwept { .. } => "outbox_swept",
            FlowEvent::Diagnostic { .. } => "diagnostic",
        }
    }
}

impl fmt::Display for FlowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowEvent::SessionStarted {
                session_id,
                flow_id,
            } => write!(f, "[{session_id}] started flow {flow_id}"),
            FlowEvent::NodeEntered {
                session_id,
                node_id,
            } => write!(f, "[{session_id}] entered {node_id}"),
            FlowEvent::StatusChanged {
                session_id,
                from,
                to,
            } => write!(f, "[{session_id}] {from} -> {to}"),
            FlowEvent::OutboxSwept {
                processed,
                dead_lettered,
            } => write!(f, "outbox sweep: {processed} processed, {dead_lettered} dead-lettered"),
            FlowEvent::Diagnostic { scope, message } => write!(f, "[{scope}] {message}"),
        }
    }
}

/// Abstraction over an output target that consumes full events.
pub trait EventSink: Send + Sync {
    fn handle(&mut self, event: &FlowEvent) -> IoResult<()>;
}

/// Stdout sink writing one display line per event.
#[derive(Default)]
pub struct StdOutSink;

impl EventSink for StdOutSink {
    fn handle(&mut self, event: &FlowEvent) -> IoResult<()> {
        let mut handle = io::stdout();
        writeln!(handle, "{event}")?;
        handle.flush()
    }
}

/// In-memory sink for tests and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<FlowEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured events.
    pub fn snapshot(&self) -> Vec<FlowEvent> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &FlowEvent) -> IoResult<()> {
        self.entries
            .lock()
            .map_err(|_| io::Error::other("memory sink poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

/// Channel sink forwarding events to an async consumer.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<FlowEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<FlowEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &FlowEvent) -> IoResult<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel receiver dropped"))
    }
}

/// Receives events from runtime components and broadcasts to sinks on
/// a background task.
pub struct EventBus {
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
    channel: (flume::Sender<FlowEvent>, flume::Receiver<FlowEvent>),
    listener: Mutex<Option<ListenerState>>,
}

struct ListenerState {
    shutdown_tx: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(StdOutSink)
    }
}

impl EventBus {
    pub fn with_sink<T: EventSink + 'static>(sink: T) -> Self {
        Self::with_sinks(vec![Box::new(sink)])
    }

    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self {
            sinks: Arc::new(Mutex::new(sinks)),
            channel: flume::unbounded(),
            listener: Mutex::new(None),
        }
    }

    /// Dynamically add a sink (e.g. per-request streaming).
    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.push(Box::new(sink));
        }
    }

    /// Sender handle for producers.
    pub fn sender(&self) -> flume::Sender<FlowEvent> {
        self.channel.0.clone()
    }

    /// Spawn the broadcast task. Idempotent.
    pub fn listen(&self) {
        let Ok(mut guard) = self.listener.lock() else {
            return;
        };
        if guard.is_some() {
            return;
        }

        let receiver = self.channel.1.clone();
        let sinks = self.sinks.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::task::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    recv = receiver.recv_async() => match recv {
                        Err(_) => break,
                        Ok(event) => {
                            let Ok(mut sinks_guard) = sinks.lock() else { break };
                            for sink in sinks_guard.iter_mut() {
                                if let Err(e) = sink.handle(&event) {
                                    tracing::warn!(error = %e, "event sink failed");
                                }
                            }
                        }
                    }
                }
            }
        });

        *guard = Some(ListenerState {
            shutdown_tx,
            handle,
        });
    }

    /// Stop the broadcast task, draining nothing further.
    pub async fn stop(&self) {
        let state = {
            let Ok(mut guard) = self.listener.lock() else {
                return;
            };
            guard.take()
        };
        if let Some(state) = state {
            let _ = state.shutdown_tx.send(());
            let _ = state.handle.await;
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.listener.lock() {
            if let Some(state) = guard.take() {
                let _ = state.shutdown_tx.send(());
                state.handle.abort();
            }
        }
    }
}
