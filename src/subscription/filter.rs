// src/subscription/filter.rs

use std::fmt;
use std::sync::Arc;

use crate::events::{Change, Event, SubjectFilter};
use crate::task::TaskState;
use crate::types::{ContextId, TaskId, WorkflowId};

type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Subject filter plus an optional predicate over individual events.
///
/// The subject part decides which events reach the subscription at all and
/// is what sequencing, replay and gap detection work on. The predicate only
/// decides which of those events are handed to the consumer.
#[derive(Clone)]
pub struct SubscriptionFilter {
    subject: SubjectFilter,
    predicate: Option<Predicate>,
}

impl SubscriptionFilter {
    pub fn new(subject: SubjectFilter) -> Self {
        Self {
            subject,
            predicate: None,
        }
    }

    pub fn task(id: TaskId) -> Self {
        Self::new(SubjectFilter::Task(id))
    }

    pub fn workflow(id: WorkflowId) -> Self {
        Self::new(SubjectFilter::Workflow(id))
    }

    pub fn context(id: impl Into<ContextId>) -> Self {
        Self::new(SubjectFilter::Context(id.into()))
    }

    pub fn all() -> Self {
        Self::new(SubjectFilter::All)
    }

    pub fn subject(&self) -> &SubjectFilter {
        &self.subject
    }

    /// Only hand over events for which `predicate` returns `true`. Replaces
    /// any previous predicate.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Only events that move their subject into a terminal state.
    pub fn terminal_only(self) -> Self {
        self.with_predicate(|event| event.change.is_terminal())
    }

    /// Only task transitions into one of `states`.
    pub fn task_states(self, states: impl IntoIterator<Item = TaskState>) -> Self {
        let states: Vec<TaskState> = states.into_iter().collect();
        self.with_predicate(move |event| match event.change {
            Change::Task { to, .. } => states.contains(&to),
            _ => false,
        })
    }

    pub fn accepts(&self, event: &Event) -> bool {
        self.subject.matches(event) && self.predicate.as_ref().is_none_or(|p| p(event))
    }
}

impl From<SubjectFilter> for SubscriptionFilter {
    fn from(subject: SubjectFilter) -> Self {
        Self::new(subject)
    }
}

impl fmt::Debug for SubscriptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionFilter")
            .field("subject", &self.subject)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}
