// src/task/store.rs

//! In-memory task store: sole mutator of task state.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::errors::{OrchestratorError, Result};
use crate::events::{Change, EventBus, EventDraft, Subject};
use crate::sync::lock;
use crate::task::{CancelSignal, NewTask, StatusReason, Task, TaskState};
use crate::types::{ContextId, Payload, TaskId};

/// Internal per-task slot. The mutex is the task's exclusive lock.
#[derive(Debug)]
struct TaskEntry {
    task: Task,
    cancel: watch::Sender<bool>,
}

/// Task registry sharded by task id.
///
/// Lookups only touch one shard of the map; every mutation then happens under
/// the task's own mutex, so transitions on different tasks never contend and
/// transitions on the same task are linearizable. Events are published while
/// the task lock is held, which keeps per-task event order identical to
/// transition order.
#[derive(Debug)]
pub struct TaskStore {
    tasks: DashMap<TaskId, Arc<Mutex<TaskEntry>>>,
    by_context: DashMap<ContextId, Vec<TaskId>>,
    bus: Arc<EventBus>,
    track_history: bool,
}

impl TaskStore {
    pub fn new(bus: Arc<EventBus>, track_history: bool) -> Self {
        Self {
            tasks: DashMap::new(),
            by_context: DashMap::new(),
            bus,
            track_history,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Create a task in `Submitted`. Creation itself publishes no event; the
    /// first event on a task subject is its first transition.
    pub fn create(&self, context_id: ContextId, params: NewTask, principal: Option<String>) -> Task {
        self.create_with_id(TaskId::new(), context_id, params, principal)
    }

    /// Create a task under an id reserved in advance, so a workflow graph can
    /// be validated before any of its tasks exist.
    pub(crate) fn create_with_id(
        &self,
        id: TaskId,
        context_id: ContextId,
        params: NewTask,
        principal: Option<String>,
    ) -> Task {
        let task = Task::new(id, context_id, params, principal, self.track_history);
        let (cancel, _) = watch::channel(false);

        self.tasks.insert(
            task.id,
            Arc::new(Mutex::new(TaskEntry {
                task: task.clone(),
                cancel,
            })),
        );
        self.by_context
            .entry(task.context_id.clone())
            .or_default()
            .push(task.id);

        debug!(task = %task.id, context = %task.context_id, "task created");
        task
    }

    /// Snapshot of a task.
    pub fn get(&self, id: TaskId) -> Result<Task> {
        let entry = self.entry(id)?;
        let guard = lock(&entry);
        Ok(guard.task.clone())
    }

    /// Current state, or `Unknown` if the id cannot be resolved.
    pub fn state_of(&self, id: TaskId) -> TaskState {
        match self.entry(id) {
            Ok(entry) => lock(&entry).task.state,
            Err(_) => TaskState::Unknown,
        }
    }

    /// All tasks sharing a context, in creation order.
    pub fn list_by_context(&self, context_id: &ContextId) -> Vec<Task> {
        let ids = self
            .by_context
            .get(context_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();

        ids.into_iter().filter_map(|id| self.get(id).ok()).collect()
    }

    /// Validate and apply a state change.
    ///
    /// The payload becomes the task's result on `Completed` and its error on
    /// `Failed` / `Rejected`; for other targets it only travels on the event.
    /// On an invalid edge nothing is mutated.
    pub fn transition(
        &self,
        id: TaskId,
        to: TaskState,
        payload: Option<Payload>,
        principal: Option<String>,
    ) -> Result<Task> {
        let entry = self.entry(id)?;
        let mut guard = lock(&entry);
        let from = guard.task.state;

        if !from.can_transition_to(to) {
            if let Some(upstream) = guard.task.upstream_failure() {
                debug!(task = %id, %upstream, target = %to, "transition on task canceled by upstream failure");
                return Err(OrchestratorError::UpstreamFailure { task: id, upstream });
            }
            warn!(task = %id, %from, %to, "rejected invalid transition");
            return Err(OrchestratorError::InvalidTransition { task: id, from, to });
        }

        guard
            .task
            .apply(to, payload.clone(), principal, None, self.track_history);
        if to == TaskState::Canceled {
            guard.cancel.send_replace(true);
        }
        self.publish_transition(&guard.task, from, payload);

        info!(task = %id, %from, %to, "task transitioned");
        Ok(guard.task.clone())
    }

    /// Cancel a task and fire its cancellation signal.
    ///
    /// Unlike [`TaskStore::transition`], this also accepts tasks still in
    /// `Submitted`.
    pub fn cancel(
        &self,
        id: TaskId,
        reason: Option<StatusReason>,
        principal: Option<String>,
    ) -> Result<Task> {
        let entry = self.entry(id)?;
        let mut guard = lock(&entry);
        let from = guard.task.state;

        if !from.can_cancel() {
            debug!(task = %id, state = %from, "cancel on task that is not cancelable");
            return Err(OrchestratorError::TaskNotCancelable {
                task: id,
                state: from,
            });
        }

        guard.task.apply(
            TaskState::Canceled,
            None,
            principal,
            reason.clone(),
            self.track_history,
        );
        guard.cancel.send_replace(true);
        self.publish_transition(&guard.task, from, None);

        match reason {
            Some(reason) => info!(task = %id, %from, %reason, "task canceled"),
            None => info!(task = %id, %from, "task canceled"),
        }
        Ok(guard.task.clone())
    }

    /// Handle an executor can watch to learn that its task was canceled.
    pub fn cancel_signal(&self, id: TaskId) -> Result<CancelSignal> {
        let entry = self.entry(id)?;
        let guard = lock(&entry);
        Ok(CancelSignal::new(guard.cancel.subscribe()))
    }

    fn entry(&self, id: TaskId) -> Result<Arc<Mutex<TaskEntry>>> {
        self.tasks
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(OrchestratorError::TaskNotFound(id))
    }

    fn publish_transition(&self, task: &Task, from: TaskState, payload: Option<Payload>) {
        self.bus.publish(EventDraft {
            subject: Subject::Task(task.id),
            context_id: Some(task.context_id.clone()),
            change: Change::Task {
                from,
                to: task.state,
            },
            reason: task.status_reason.as_ref().map(|r| r.to_string()),
            payload,
        });
    }
}
