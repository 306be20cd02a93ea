// src/events/event.rs

//! Immutable change records and the subjects they belong to.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::WorkflowStatus;
use crate::task::TaskState;
use crate::types::{ContextId, Payload, TaskId, WorkflowId};

/// The entity an event is about. Sequence numbers are scoped per subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "id")]
pub enum Subject {
    Task(TaskId),
    Workflow(WorkflowId),
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Task(id) => write!(f, "task:{id}"),
            Subject::Workflow(id) => write!(f, "workflow:{id}"),
        }
    }
}

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum Change {
    /// A task moved between two states.
    Task { from: TaskState, to: TaskState },
    /// The scheduler found the task's start dependencies satisfied. The task
    /// itself stays `submitted` until its agent picks it up.
    TaskEligible { workflow: WorkflowId },
    /// A workflow moved between two statuses.
    Workflow {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
}

impl Change {
    /// Label of the state before the change.
    pub fn old_state(&self) -> &'static str {
        match self {
            Change::Task { from, .. } => from.as_str(),
            Change::TaskEligible { .. } => TaskState::Submitted.as_str(),
            Change::Workflow { from, .. } => from.as_str(),
        }
    }

    /// Label of the state after the change.
    pub fn new_state(&self) -> &'static str {
        match self {
            Change::Task { to, .. } => to.as_str(),
            Change::TaskEligible { .. } => TaskState::Submitted.as_str(),
            Change::Workflow { to, .. } => to.as_str(),
        }
    }

    /// Whether the subject reached a terminal state with this change.
    pub fn is_terminal(&self) -> bool {
        match self {
            Change::Task { to, .. } => to.is_terminal(),
            Change::TaskEligible { .. } => false,
            Change::Workflow { to, .. } => to.is_terminal(),
        }
    }
}

/// One published change, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Per-subject sequence number, starting at 1 and contiguous.
    pub seq: u64,
    pub subject: Subject,
    /// Context of the task or workflow the event is about.
    pub context_id: Option<ContextId>,
    pub timestamp: DateTime<Utc>,
    pub change: Change,
    pub reason: Option<String>,
    /// Payload snapshot accompanying the change (result, error, prompt, ...).
    pub payload: Option<Payload>,
}

/// An event before the bus assigns its sequence number and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub subject: Subject,
    pub context_id: Option<ContextId>,
    pub change: Change,
    pub reason: Option<String>,
    pub payload: Option<Payload>,
}

/// Which subjects a subscription wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubjectFilter {
    Task(TaskId),
    Workflow(WorkflowId),
    /// Every task event carrying this context id.
    Context(ContextId),
    All,
}

impl SubjectFilter {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            SubjectFilter::Task(id) => event.subject == Subject::Task(*id),
            SubjectFilter::Workflow(id) => event.subject == Subject::Workflow(*id),
            SubjectFilter::Context(ctx) => event.context_id.as_ref() == Some(ctx),
            SubjectFilter::All => true,
        }
    }

    /// The single subject this filter names, if it names exactly one.
    pub fn single_subject(&self) -> Option<Subject> {
        match self {
            SubjectFilter::Task(id) => Some(Subject::Task(*id)),
            SubjectFilter::Workflow(id) => Some(Subject::Workflow(*id)),
            SubjectFilter::Context(_) | SubjectFilter::All => None,
        }
    }
}

impl fmt::Display for SubjectFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectFilter::Task(id) => write!(f, "task:{id}"),
            SubjectFilter::Workflow(id) => write!(f, "workflow:{id}"),
            SubjectFilter::Context(ctx) => write!(f, "context:{ctx}"),
            SubjectFilter::All => f.write_str("*"),
        }
    }
}
