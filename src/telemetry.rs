//! Tracing subscriber setup for binaries and tests.
//!
//! The library itself only emits `tracing` events; installing a
//! subscriber is the embedding's choice. [`init`] wires the common
//! stack: env-filtered fmt output plus span-trace capture for error
//! reports.

use std::io::IsTerminal;

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber: `RUST_LOG`-filtered fmt layer (ANSI
/// when stderr is a terminal) plus [`ErrorLayer`] for span traces.
///
/// Returns quietly if a subscriber is already installed, so tests can
/// call it repeatedly.
pub fn init() {
    init_with_filter("info");
}

/// Like [`init`], with an explicit default filter used when `RUST_LOG`
/// is unset.
pub fn init_with_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal()),
        )
        .with(ErrorLayer::default())
        .try_init();
}
