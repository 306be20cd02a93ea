// src/engine/starter.rs

//! Hook invoked when a workflow member becomes eligible to start.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::{ContextId, Payload, TaskId, WorkflowId};

/// Everything an agent needs to pick up an eligible task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EligibleTask {
    pub task_id: TaskId,
    pub workflow_id: WorkflowId,
    /// Member key within the workflow (`key#n` for loop iterations).
    pub key: String,
    pub context_id: ContextId,
    pub agent: Option<String>,
    pub input: Option<Payload>,
    pub iteration: Option<u32>,
}

/// Receives eligibility signals from the scheduler.
///
/// The scheduler never starts tasks itself: it only reports that a task's
/// start dependencies are satisfied. Whoever receives the signal moves the
/// task to `working` through the orchestrator.
///
/// Called while the workflow's scheduling pass is in progress, so an
/// implementation must return quickly. It may transition tasks, but must not
/// call workflow-level operations (status, structure) for the same workflow
/// on the calling thread.
pub trait TaskStarter: Send + Sync {
    fn task_eligible(&self, task: EligibleTask);
}

/// Ignores every signal. Eligibility is still visible as `task-eligible`
/// events on the bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStarter;

impl TaskStarter for NoopStarter {
    fn task_eligible(&self, _task: EligibleTask) {}
}

/// Forwards eligible tasks into an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelStarter {
    tx: mpsc::UnboundedSender<EligibleTask>,
}

impl ChannelStarter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EligibleTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl fmt::Debug for ChannelStarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelStarter")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl TaskStarter for ChannelStarter {
    fn task_eligible(&self, task: EligibleTask) {
        let task_id = task.task_id;
        if self.tx.send(task).is_err() {
            warn!(task = %task_id, "eligible task dropped: starter channel closed");
        }
    }
}
