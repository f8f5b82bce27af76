//! Flow execution: the runtime, node processors, and action runner.
//!
//! - [`runner::FlowRuntime`] owns session lifecycle and the bounded
//!   non-interactive chain
//! - [`processors`] holds the closed per-node-type processor registry
//! - [`actions`] executes ACTION node and composite-child action lists

pub mod actions;
pub mod processors;
pub mod runner;

pub use actions::{ActionReport, ApiRegistry};
pub use processors::{
    NodeOutcome, NodeProcessor, PauseReason, ProcessorCx, ProcessorError, ProcessorRegistry,
};
pub use runner::{FlowRuntime, InteractionReply, RunnerError};
