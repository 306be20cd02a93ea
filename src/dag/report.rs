// src/dag/report.rs

use serde::Serialize;

use crate::dag::{PatternTag, WorkflowStatus};
use crate::task::TaskState;
use crate::types::{ContextId, FailurePolicy, TaskId, WorkflowId};

/// One member's line in a [`WorkflowReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberReport {
    pub id: TaskId,
    pub key: String,
    pub state: TaskState,
    /// Signalled as eligible by the scheduler.
    pub eligible: bool,
    pub skipped: bool,
    pub iteration: Option<u32>,
}

/// A task the scheduler canceled because `upstream` did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollateralCancel {
    pub task: TaskId,
    pub upstream: TaskId,
}

/// Status of a workflow and all of its members, with failures split into
/// root causes and their collateral.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowReport {
    pub id: WorkflowId,
    pub name: String,
    pub version: String,
    pub pattern: PatternTag,
    pub failure_policy: FailurePolicy,
    pub context_id: ContextId,
    pub status: WorkflowStatus,
    /// Members in declaration order.
    pub tasks: Vec<MemberReport>,
    /// Members that failed or were rejected on their own.
    pub root_failures: Vec<TaskId>,
    pub collateral: Vec<CollateralCancel>,
    pub skipped: Vec<TaskId>,
    /// Current loop iteration, for loop workflows.
    pub iteration: Option<u32>,
}

impl WorkflowReport {
    pub fn task(&self, key: &str) -> Option<&MemberReport> {
        self.tasks.iter().find(|t| t.key == key)
    }

    pub fn state_of(&self, key: &str) -> Option<TaskState> {
        self.task(key).map(|t| t.state)
    }

    pub fn upstream_of(&self, task: TaskId) -> Option<TaskId> {
        self.collateral
            .iter()
            .find(|c| c.task == task)
            .map(|c| c.upstream)
    }
}
