// src/dag/task_info.rs

//! Per-member scheduling metadata.

use std::collections::HashMap;

use crate::task::{Task, TaskState};
use crate::types::{ContextId, Payload, TaskId};

/// What the scheduler tracks about a workflow member on top of the task's
/// own state in the store.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub id: TaskId,
    pub key: String,
    /// Loop iteration the task belongs to, for loop instances.
    pub iteration: Option<u32>,
    /// Already signalled as eligible; a task is signalled at most once.
    pub signaled: bool,
    /// Gated by a condition that resolved false (directly or transitively).
    /// Skipped tasks stay `submitted` and count as settled.
    pub skipped: bool,
    /// Set when the scheduler canceled the task because `upstream` did not
    /// succeed.
    pub collateral: Option<TaskId>,
}

impl MemberInfo {
    pub fn new(id: TaskId, key: String, iteration: Option<u32>) -> Self {
        Self {
            id,
            key,
            iteration,
            signaled: false,
            skipped: false,
            collateral: None,
        }
    }
}

/// A member the scheduler has reserved an id for and that still has to be
/// created in the task store.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTask {
    pub id: TaskId,
    pub key: String,
    pub context_id: ContextId,
    pub agent: Option<String>,
    pub input: Option<Payload>,
    pub iteration: Option<u32>,
}

/// The parts of a task's store record that scheduling decisions read.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskView {
    pub state: TaskState,
    pub result: Option<Payload>,
    /// The task has been `working` at some point.
    pub started: bool,
}

impl TaskView {
    /// View inferred from the state alone. A `canceled` task is assumed to
    /// have been canceled before it ever ran.
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            result: None,
            started: matches!(
                state,
                TaskState::Working
                    | TaskState::InputRequired
                    | TaskState::AuthRequired
                    | TaskState::Completed
                    | TaskState::Failed
            ),
        }
    }
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            state: task.state,
            started: task.started_at.is_some(),
            result: task.result,
        }
    }
}

/// Snapshot of every member's state, taken at the start of a pass.
pub type WorkflowView = HashMap<TaskId, TaskView>;
