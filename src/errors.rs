// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

use crate::dag::WorkflowStatus;
use crate::events::Subject;
use crate::task::TaskState;
use crate::types::{TaskId, WorkflowId};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("dependency {from} -> {to} would create a cycle in workflow {workflow}")]
    CyclicDependency {
        workflow: WorkflowId,
        from: TaskId,
        to: TaskId,
    },

    #[error(
        "replay of {subject} from sequence {requested} is outside the buffer window (oldest retained: {oldest})"
    )]
    ReplayWindowExceeded {
        subject: Subject,
        requested: u64,
        oldest: u64,
    },

    #[error("task {task} is already {state} and cannot be canceled")]
    TaskNotCancelable { task: TaskId, state: TaskState },

    #[error("a scheduling pass is in progress for workflow {0}; retry")]
    SchedulingConflict(WorkflowId),

    #[error("task {task} was canceled because upstream task {upstream} did not succeed")]
    UpstreamFailure { task: TaskId, upstream: TaskId },

    #[error("task {task} cannot complete before {waiting_on:?}")]
    CompletionBlocked {
        task: TaskId,
        waiting_on: Vec<TaskId>,
    },

    #[error("workflow {workflow} is {status}; cannot {operation}")]
    WorkflowNotMutable {
        workflow: WorkflowId,
        status: WorkflowStatus,
        operation: &'static str,
    },

    #[error("unknown task key in workflow definition: {0}")]
    UnknownTaskKey(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Whether the caller may retry the same operation and expect it to
    /// succeed later. The core never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::SchedulingConflict(_) | OrchestratorError::CompletionBlocked { .. }
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_and_blocked_completions_are_retryable() {
        let wf = WorkflowId::new();
        let task = TaskId::new();

        assert!(OrchestratorError::SchedulingConflict(wf).is_retryable());
        assert!(
            OrchestratorError::CompletionBlocked {
                task,
                waiting_on: vec![TaskId::new()],
            }
            .is_retryable()
        );
        assert!(
            !OrchestratorError::InvalidTransition {
                task,
                from: TaskState::Completed,
                to: TaskState::Working,
            }
            .is_retryable()
        );
        assert!(
            !OrchestratorError::CyclicDependency {
                workflow: wf,
                from: task,
                to: TaskId::new(),
            }
            .is_retryable()
        );
    }
}
