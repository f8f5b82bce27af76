//! Async task dispatch for background node processing.
//!
//! A [`NodeTask`] pins the session revision it was created against;
//! the idempotent handler in the runtime discards tasks whose session
//! has moved on or disappeared. [`InProcessDispatcher`] runs tasks on
//! tokio workers; an embedding with an external queue implements
//! [`TaskDispatcher`] over it instead.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use uuid::Uuid;

use crate::runtime::FlowRuntime;

/// One background node-processing task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeTask {
    pub session_id: Uuid,
    pub node_id: String,
    /// Session revision the task was scheduled against.
    pub session_revision: u64,
    /// Ledger key, derived as `{session_id}:{node_id}:{revision}`.
    pub idempotency_key: String,
}

impl NodeTask {
    #[must_use]
    pub fn new(session_id: Uuid, node_id: impl Into<String>, session_revision: u64) -> Self {
        let node_id = node_id.into();
        let idempotency_key = format!("{session_id}:{node_id}:{session_revision}");
        Self {
            session_id,
            node_id,
            session_revision,
            idempotency_key,
        }
    }
}

/// Terminal status of one task execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task ran the chain and completed the ledger record.
    Completed,
    /// The session no longer exists; the task was recorded as
    /// discarded and will not retry.
    DiscardedSessionNotFound,
    /// The session moved past the scheduled revision; discarded.
    DiscardedStale,
    /// Another execution already owns or finished this key.
    AlreadyProcessed,
}

#[derive(Debug, Error, Diagnostic)]
pub enum DispatchError {
    #[error("task queue rejected the task: {message}")]
    #[diagnostic(code(chatloom::dispatcher::rejected))]
    Rejected { message: String },
}

/// Seam between the runtime and whatever queue carries tasks.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Enqueue a task for execution. Returns once the task is accepted,
    /// not once it ran.
    async fn dispatch(&self, task: NodeTask) -> Result<(), DispatchError>;
}

/// Runs tasks on tokio workers in the current process.
pub struct InProcessDispatcher {
    runtime: Arc<FlowRuntime>,
}

impl InProcessDispatcher {
    #[must_use]
    pub fn new(runtime: Arc<FlowRuntime>) -> Self {
        Self { runtime }
    }

    /// Run a task to completion on the caller's task. Used by tests
    /// and embeddings that want the result synchronously.
    pub async fn run_now(&self, task: NodeTask) -> Result<TaskStatus, crate::runtime::RunnerError> {
        self.runtime.handle_task(&task).await
    }
}

#[async_trait]
impl TaskDispatcher for InProcessDispatcher {
    async fn dispatch(&self, task: NodeTask) -> Result<(), DispatchError> {
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            match runtime.handle_task(&task).await {
                Ok(status) => {
                    tracing::debug!(
                        session_id = %task.session_id,
                        node_id = %task.node_id,
                        ?status,
                        "task finished"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %task.session_id,
                        node_id = %task.node_id,
                        error = %e,
                        "task failed"
                    );
                }
            }
        });
        Ok(())
    }
}
