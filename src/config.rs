//! Runtime configuration resolved from explicit values and environment.
//!
//! All services receive their configuration and collaborators by
//! injection; nothing here installs process-global state.

use crate::event_bus::{EventBus, EventSink, MemorySink, StdOutSink};

/// Top-level runtime configuration.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// SQLite database file for the persistent stores, when enabled.
    pub sqlite_db_name: Option<String>,
    /// Bound on the non-interactive node chain per interaction.
    pub max_chain_length: usize,
    /// Sessions idle longer than this are swept to EXPIRED.
    pub session_idle_timeout_secs: u64,
    pub event_bus: EventBusConfig,
    pub outbox: OutboxConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sqlite_db_name: Self::resolve_sqlite_db_name(None),
            max_chain_length: 64,
            session_idle_timeout_secs: 86_400,
            event_bus: EventBusConfig::default(),
            outbox: OutboxConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn resolve_sqlite_db_name(provided: Option<String>) -> Option<String> {
        if let Some(name) = provided {
            return Some(name);
        }
        dotenvy::dotenv().ok();
        Some(std::env::var("CHATLOOM_SQLITE_DB").unwrap_or_else(|_| "chatloom.db".to_string()))
    }

    pub fn new(sqlite_db_name: Option<String>) -> Self {
        Self {
            sqlite_db_name: Self::resolve_sqlite_db_name(sqlite_db_name),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_max_chain_length(mut self, limit: usize) -> Self {
        self.max_chain_length = limit;
        self
    }

    #[must_use]
    pub fn with_session_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.session_idle_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_event_bus(mut self, event_bus: EventBusConfig) -> Self {
        self.event_bus = event_bus;
        self
    }

    #[must_use]
    pub fn with_outbox(mut self, outbox: OutboxConfig) -> Self {
        self.outbox = outbox;
        self
    }
}

/// Sweep configuration for the event outbox.
#[derive(Clone, Debug)]
pub struct OutboxConfig {
    /// Events claimed per sweep.
    pub batch_size: usize,
    /// Retry backoff schedule in seconds, indexed by retry count and
    /// clamped to the last entry.
    pub retry_delays_secs: Vec<u64>,
    /// Default retry budget for new events.
    pub max_retries: u32,
    /// Events stuck in PROCESSING longer than this are re-queued.
    pub stale_claim_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            retry_delays_secs: vec![60, 300, 900, 3600],
            max_retries: 3,
            stale_claim_secs: 600,
        }
    }
}

/// Which sinks the event bus should broadcast to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkConfig {
    StdOut,
    Memory,
}

#[derive(Clone, Debug)]
pub struct EventBusConfig {
    pub sinks: Vec<SinkConfig>,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            sinks: vec![SinkConfig::StdOut],
        }
    }
}

impl EventBusConfig {
    #[must_use]
    pub fn with_memory_sink() -> Self {
        Self {
            sinks: vec![SinkConfig::Memory],
        }
    }

    #[must_use]
    pub fn add_sink(mut self, sink: SinkConfig) -> Self {
        if !self.sinks.contains(&sink) {
            self.sinks.push(sink);
        }
        self
    }

    /// Materialize the configured bus. The listener is not started;
    /// callers decide when to begin broadcasting.
    #[must_use]
    pub fn build_event_bus(&self) -> EventBus {
        let sinks: Vec<Box<dyn EventSink>> = self
            .sinks
            .iter()
            .map(|s| match s {
                SinkConfig::StdOut => Box::new(StdOutSink) as Box<dyn EventSink>,
                SinkConfig::Memory => Box::new(MemorySink::new()) as Box<dyn EventSink>,
            })
            .collect();
        EventBus::with_sinks(sinks)
    }
}
