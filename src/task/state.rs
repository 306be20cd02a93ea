// src/task/state.rs

//! The task state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
///
/// Allowed transitions:
///
/// - `Submitted` -> `Working`, `Rejected`
/// - `Working` -> `InputRequired`, `AuthRequired`, `Completed`, `Failed`, `Canceled`
/// - `InputRequired` -> `Working`, `Canceled`, `Failed`
/// - `AuthRequired` -> `Working`, `Canceled`, `Failed`
/// - `Completed`, `Canceled`, `Failed`, `Rejected` are terminal.
/// - `Unknown` is only reported for ids that cannot be resolved and never
///   transitions anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    AuthRequired,
    Completed,
    Canceled,
    Failed,
    Rejected,
    Unknown,
}

impl TaskState {
    /// Every state, in declaration order.
    pub const ALL: [TaskState; 9] = [
        TaskState::Submitted,
        TaskState::Working,
        TaskState::InputRequired,
        TaskState::AuthRequired,
        TaskState::Completed,
        TaskState::Canceled,
        TaskState::Failed,
        TaskState::Rejected,
        TaskState::Unknown,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Canceled | TaskState::Failed | TaskState::Rejected
        )
    }

    /// Terminal, but not `Completed`.
    pub fn is_unsuccessful(self) -> bool {
        self.is_terminal() && self != TaskState::Completed
    }

    /// Whether the task has left `Submitted` (i.e. its agent picked it up, or
    /// it reached a terminal state some other way).
    pub fn has_started(self) -> bool {
        !matches!(self, TaskState::Submitted | TaskState::Unknown)
    }

    /// Edge check against the transition table.
    pub fn can_transition_to(self, to: TaskState) -> bool {
        matches!(
            (self, to),
            (TaskState::Submitted, TaskState::Working)
                | (TaskState::Submitted, TaskState::Rejected)
                | (TaskState::Working, TaskState::InputRequired)
                | (TaskState::Working, TaskState::AuthRequired)
                | (TaskState::Working, TaskState::Completed)
                | (TaskState::Working, TaskState::Failed)
                | (TaskState::Working, TaskState::Canceled)
                | (TaskState::InputRequired, TaskState::Working)
                | (TaskState::InputRequired, TaskState::Canceled)
                | (TaskState::InputRequired, TaskState::Failed)
                | (TaskState::AuthRequired, TaskState::Working)
                | (TaskState::AuthRequired, TaskState::Canceled)
                | (TaskState::AuthRequired, TaskState::Failed)
        )
    }

    /// Whether an explicit cancel request may move this state to `Canceled`.
    ///
    /// Wider than the transition table: work that never started can be
    /// canceled administratively (workflow cancellation, upstream failure).
    pub fn can_cancel(self) -> bool {
        matches!(
            self,
            TaskState::Submitted
                | TaskState::Working
                | TaskState::InputRequired
                | TaskState::AuthRequired
        )
    }

    /// States directly reachable from this one through the transition table.
    pub fn successors(self) -> impl Iterator<Item = TaskState> {
        TaskState::ALL
            .into_iter()
            .filter(move |to| self.can_transition_to(*to))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Submitted => "submitted",
            TaskState::Working => "working",
            TaskState::InputRequired => "input-required",
            TaskState::AuthRequired => "auth-required",
            TaskState::Completed => "completed",
            TaskState::Canceled => "canceled",
            TaskState::Failed => "failed",
            TaskState::Rejected => "rejected",
            TaskState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn terminal_states_have_no_successors() {
        for state in TaskState::ALL {
            if state.is_terminal() || state == TaskState::Unknown {
                assert_eq!(state.successors().count(), 0, "{state} should be a sink");
            }
        }
    }

    #[test]
    fn unknown_is_not_reachable_from_submitted() {
        let mut seen = HashSet::new();
        let mut stack = vec![TaskState::Submitted];
        while let Some(state) = stack.pop() {
            if seen.insert(state) {
                stack.extend(state.successors());
            }
        }
        assert!(!seen.contains(&TaskState::Unknown));
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn cancel_is_allowed_before_start_but_not_after_terminal() {
        assert!(TaskState::Submitted.can_cancel());
        assert!(!TaskState::Submitted.can_transition_to(TaskState::Canceled));
        assert!(TaskState::InputRequired.can_cancel());
        assert!(!TaskState::Completed.can_cancel());
        assert!(!TaskState::Unknown.can_cancel());
    }

    #[test]
    fn serializes_in_kebab_case() {
        let json = serde_json::to_string(&TaskState::InputRequired).unwrap();
        assert_eq!(json, "\"input-required\"");
        assert_eq!(TaskState::AuthRequired.to_string(), "auth-required");
    }
}
