// src/task/model.rs

//! Task entity and its history records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskState;
use crate::types::{ContextId, Payload, TaskId, WorkflowId};

/// Why a task reached its current state, when the store knows more than the
/// bare state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum StatusReason {
    /// Canceled because a finish-to-start predecessor did not succeed.
    UpstreamFailure { upstream: TaskId },
    /// Canceled as part of canceling its whole workflow.
    WorkflowCanceled { workflow: WorkflowId },
    /// Free-form reason supplied by the caller.
    Message { text: String },
}

impl fmt::Display for StatusReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusReason::UpstreamFailure { upstream } => {
                write!(f, "upstream failure (task {upstream})")
            }
            StatusReason::WorkflowCanceled { workflow } => {
                write!(f, "workflow {workflow} canceled")
            }
            StatusReason::Message { text } => f.write_str(text),
        }
    }
}

/// One entry in a task's state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub state: TaskState,
    pub at: DateTime<Utc>,
    /// Principal that requested the change, as reported by the auth layer.
    pub principal: Option<String>,
    pub reason: Option<StatusReason>,
}

/// A unit of work assigned to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub context_id: ContextId,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// First time the task entered `Working`.
    pub started_at: Option<DateTime<Utc>>,
    /// Past and current states, oldest first. Empty when history tracking is
    /// disabled.
    pub history: Vec<StateRecord>,
    /// Set only once the task is `Completed`.
    pub result: Option<Payload>,
    /// Set only once the task is `Failed` or `Rejected`.
    pub error: Option<Payload>,
    pub status_reason: Option<StatusReason>,
    /// Routing label for the agent expected to do the work.
    pub agent: Option<String>,
    pub input: Option<Payload>,
}

/// Creation parameters for a task beyond its context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTask {
    pub agent: Option<String>,
    pub input: Option<Payload>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        context_id: ContextId,
        params: NewTask,
        principal: Option<String>,
        track_history: bool,
    ) -> Self {
        let now = Utc::now();
        let history = if track_history {
            vec![StateRecord {
                state: TaskState::Submitted,
                at: now,
                principal,
                reason: None,
            }]
        } else {
            Vec::new()
        };

        Self {
            id,
            context_id,
            state: TaskState::Submitted,
            created_at: now,
            updated_at: now,
            started_at: None,
            history,
            result: None,
            error: None,
            status_reason: None,
            agent: params.agent,
            input: params.input,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Upstream task whose failure canceled this one, if that is why it is
    /// canceled.
    pub fn upstream_failure(&self) -> Option<TaskId> {
        match (&self.state, &self.status_reason) {
            (TaskState::Canceled, Some(StatusReason::UpstreamFailure { upstream })) => {
                Some(*upstream)
            }
            _ => None,
        }
    }

    /// Apply an already-validated state change.
    pub(crate) fn apply(
        &mut self,
        to: TaskState,
        payload: Option<Payload>,
        principal: Option<String>,
        reason: Option<StatusReason>,
        track_history: bool,
    ) {
        let now = Utc::now();
        match to {
            TaskState::Completed => self.result = payload,
            TaskState::Failed | TaskState::Rejected => self.error = payload,
            _ => {}
        }
        if to == TaskState::Working && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.state = to;
        self.updated_at = now;
        self.status_reason = reason.clone();
        if track_history {
            self.history.push(StateRecord {
                state: to,
                at: now,
                principal,
                reason,
            });
        }
    }
}
