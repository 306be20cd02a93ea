// src/dag/scheduler_step.rs

use crate::dag::WorkflowStatus;
use crate::types::TaskId;

/// Outcome of one scheduling pass. The scheduler has already updated its own
/// bookkeeping; the caller applies the effects to the store and the bus.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStep {
    /// Tasks whose start dependencies just became satisfied.
    pub newly_eligible: Vec<TaskId>,
    /// `(task, upstream)`: not-yet-started tasks to cancel because `upstream`
    /// did not succeed.
    pub newly_canceled: Vec<(TaskId, TaskId)>,
    /// Tasks gated off by a condition that resolved false.
    pub newly_skipped: Vec<TaskId>,
    /// Loop iteration to instantiate next.
    pub spawn_iteration: Option<u32>,
    /// `(from, to)` when the workflow status changed.
    pub status_change: Option<(WorkflowStatus, WorkflowStatus)>,
}

impl SchedulerStep {
    pub fn is_empty(&self) -> bool {
        self.newly_eligible.is_empty()
            && self.newly_canceled.is_empty()
            && self.newly_skipped.is_empty()
            && self.spawn_iteration.is_none()
            && self.status_change.is_none()
    }
}
