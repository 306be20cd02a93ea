// src/engine/orchestrator.rs

//! The external surface: task, workflow and subscription operations over one
//! shared store, bus and set of workflow schedulers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::dag::{
    CompletionGates, Condition, Dependency, DependencyKind, DependencySpec, TaskSpec, TaskView,
    WorkflowDefinition, WorkflowReport, WorkflowScheduler, WorkflowStatus, WorkflowView,
};
use crate::engine::event_handlers::{self, StepEffects};
use crate::engine::idempotency::IdempotencyCache;
use crate::engine::starter::{NoopStarter, TaskStarter};
use crate::errors::{OrchestratorError, Result};
use crate::events::EventBus;
use crate::subscription::{SubscriptionFilter, SubscriptionHandle, SubscriptionInfo, SubscriptionManager};
use crate::sync::{lock, read, write};
use crate::task::{CancelSignal, NewTask, StatusReason, Task, TaskState, TaskStore};
use crate::types::{CallContext, ContextId, Payload, SubscriptionId, TaskId, WorkflowId};

/// A workflow's scheduler plus its "pass requested" flag.
///
/// Whoever holds the mutex runs passes until `dirty` stays clear, so a
/// trigger that finds the lock taken only has to set the flag. `gates` is
/// refreshed before the scheduler lock is released after any change.
struct WorkflowSlot {
    scheduler: Mutex<WorkflowScheduler>,
    dirty: AtomicBool,
    gates: RwLock<CompletionGates>,
}

impl WorkflowSlot {
    fn new(scheduler: WorkflowScheduler) -> Self {
        Self {
            gates: RwLock::new(scheduler.completion_gates()),
            scheduler: Mutex::new(scheduler),
            dirty: AtomicBool::new(false),
        }
    }

    fn refresh_gates(&self, scheduler: &WorkflowScheduler) {
        *write(&self.gates) = scheduler.completion_gates();
    }
}

struct Inner {
    config: RuntimeConfig,
    bus: Arc<EventBus>,
    store: TaskStore,
    subscriptions: SubscriptionManager,
    workflows: DashMap<WorkflowId, Arc<WorkflowSlot>>,
    membership: DashMap<TaskId, WorkflowId>,
    starter: Arc<dyn TaskStarter>,
    idempotency: IdempotencyCache,
}

/// Cheaply cloneable handle to the orchestration core.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("tasks", &self.inner.store.len())
            .field("workflows", &self.inner.workflows.len())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Orchestrator {
    /// Orchestrator whose eligibility signals are only visible on the bus.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_starter(config, Arc::new(NoopStarter))
    }

    pub fn with_starter(config: RuntimeConfig, starter: Arc<dyn TaskStarter>) -> Self {
        let bus = Arc::new(EventBus::new(config.replay_buffer_size));
        let store = TaskStore::new(Arc::clone(&bus), config.track_history);
        let subscriptions =
            SubscriptionManager::new(Arc::clone(&bus), config.subscriber_queue_capacity);
        let idempotency = IdempotencyCache::new(config.idempotency_cache_size);

        debug!(
            replay_buffer_size = config.replay_buffer_size,
            subscriber_queue_capacity = config.subscriber_queue_capacity,
            default_failure_policy = %config.default_failure_policy,
            "orchestrator initialised"
        );

        Self {
            inner: Arc::new(Inner {
                config,
                bus,
                store,
                subscriptions,
                workflows: DashMap::new(),
                membership: DashMap::new(),
                starter,
                idempotency,
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    // ---------------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------------

    /// Create a standalone task in `submitted`.
    pub fn create_task(&self, context_id: impl Into<ContextId>) -> TaskId {
        self.inner
            .store
            .create(context_id.into(), NewTask::default(), None)
            .id
    }

    pub fn create_task_with(
        &self,
        ctx: &CallContext,
        context_id: ContextId,
        params: NewTask,
    ) -> Result<Task> {
        self.idempotent("create_task", ctx, || {
            Ok(self
                .inner
                .store
                .create(context_id, params, ctx.principal.clone()))
        })
    }

    pub fn get_task(&self, task: TaskId) -> Result<Task> {
        self.inner.store.get(task)
    }

    /// Current state, `unknown` for ids that do not resolve.
    pub fn task_state(&self, task: TaskId) -> TaskState {
        self.inner.store.state_of(task)
    }

    pub fn list_tasks(&self, context_id: &ContextId) -> Vec<Task> {
        self.inner.store.list_by_context(context_id)
    }

    pub fn cancel_signal(&self, task: TaskId) -> Result<CancelSignal> {
        self.inner.store.cancel_signal(task)
    }

    /// Workflow a task belongs to, if any.
    pub fn workflow_of(&self, task: TaskId) -> Option<WorkflowId> {
        self.inner.membership.get(&task).map(|wf| *wf.value())
    }

    pub fn transition_task(
        &self,
        task: TaskId,
        to: TaskState,
        payload: Option<Payload>,
    ) -> Result<Task> {
        self.transition_task_with(&CallContext::default(), task, to, payload)
    }

    /// Move a task along the state machine.
    ///
    /// For workflow members, completing is refused with `CompletionBlocked`
    /// while a finish-to-finish or start-to-finish predecessor has not caught
    /// up; the caller may retry later.
    pub fn transition_task_with(
        &self,
        ctx: &CallContext,
        task: TaskId,
        to: TaskState,
        payload: Option<Payload>,
    ) -> Result<Task> {
        self.idempotent("transition_task", ctx, || {
            let workflow = self.workflow_of(task);
            if let (TaskState::Completed, Some(workflow)) = (to, workflow) {
                self.check_completion_gates(workflow, task)?;
            }

            let updated = self
                .inner
                .store
                .transition(task, to, payload, ctx.principal.clone())?;
            if let Some(workflow) = workflow {
                self.schedule(workflow);
            }
            Ok(updated)
        })
    }

    pub fn cancel_task(&self, task: TaskId) -> Result<Task> {
        self.cancel_task_with(&CallContext::default(), task)
    }

    /// Cancel a task. Under the block policy this also cancels its
    /// not-yet-started finish-to-start dependents.
    pub fn cancel_task_with(&self, ctx: &CallContext, task: TaskId) -> Result<Task> {
        self.idempotent("cancel_task", ctx, || {
            let canceled = self
                .inner
                .store
                .cancel(task, None, ctx.principal.clone())?;
            if let Some(workflow) = self.workflow_of(task) {
                self.schedule(workflow);
            }
            Ok(canceled)
        })
    }

    // ---------------------------------------------------------------------
    // Workflows
    // ---------------------------------------------------------------------

    pub fn create_workflow(
        &self,
        definition: WorkflowDefinition,
        tasks: Vec<TaskSpec>,
        dependencies: Vec<DependencySpec>,
    ) -> Result<WorkflowId> {
        self.create_workflow_with(&CallContext::default(), definition, tasks, dependencies)
    }

    /// Validate and register a workflow in `created`. Nothing is created in
    /// the store unless the whole definition is valid.
    pub fn create_workflow_with(
        &self,
        ctx: &CallContext,
        mut definition: WorkflowDefinition,
        tasks: Vec<TaskSpec>,
        dependencies: Vec<DependencySpec>,
    ) -> Result<WorkflowId> {
        self.idempotent("create_workflow", ctx, || {
            if definition.failure_policy.is_none() {
                definition.failure_policy = Some(self.inner.config.default_failure_policy);
            }

            let id = WorkflowId::new();
            let (scheduler, planned) = WorkflowScheduler::plan(id, definition, tasks, dependencies)?;
            self.effects()
                .create_members(id, &planned, ctx.principal.clone());

            info!(
                workflow = %id,
                name = %scheduler.definition().name,
                pattern = %scheduler.definition().pattern,
                policy = %scheduler.definition().policy(),
                tasks = planned.len(),
                "workflow created"
            );
            self.inner
                .workflows
                .insert(id, Arc::new(WorkflowSlot::new(scheduler)));
            Ok(id)
        })
    }

    pub fn add_task_to_workflow(&self, workflow: WorkflowId, spec: TaskSpec) -> Result<TaskId> {
        self.add_task_to_workflow_with(&CallContext::default(), workflow, spec)
    }

    pub fn add_task_to_workflow_with(
        &self,
        ctx: &CallContext,
        workflow: WorkflowId,
        spec: TaskSpec,
    ) -> Result<TaskId> {
        self.idempotent("add_task_to_workflow", ctx, || {
            let slot = self.slot(workflow)?;
            let id = {
                let mut scheduler = self.lock_structural(workflow, &slot)?;
                let planned = scheduler.add_member(spec, None)?;
                slot.refresh_gates(&scheduler);
                self.effects().create_members(
                    workflow,
                    std::slice::from_ref(&planned),
                    ctx.principal.clone(),
                );
                debug!(%workflow, task = %planned.id, key = %planned.key, "member added");
                planned.id
            };
            self.schedule(workflow);
            Ok(id)
        })
    }

    pub fn add_dependency(
        &self,
        workflow: WorkflowId,
        from: TaskId,
        to: TaskId,
        kind: DependencyKind,
        condition: Option<Condition>,
    ) -> Result<()> {
        self.add_dependency_with(&CallContext::default(), workflow, from, to, kind, condition)
    }

    /// Add an edge between two existing members. A cycle is rejected with
    /// `CyclicDependency` and leaves the graph unchanged.
    pub fn add_dependency_with(
        &self,
        ctx: &CallContext,
        workflow: WorkflowId,
        from: TaskId,
        to: TaskId,
        kind: DependencyKind,
        condition: Option<Condition>,
    ) -> Result<()> {
        self.idempotent("add_dependency", ctx, || {
            let slot = self.slot(workflow)?;
            {
                let mut scheduler = self.lock_structural(workflow, &slot)?;
                scheduler.add_dependency(Dependency {
                    from,
                    to,
                    kind,
                    condition,
                })?;
                slot.refresh_gates(&scheduler);
            }
            self.schedule(workflow);
            Ok(())
        })
    }

    pub fn start_workflow(&self, workflow: WorkflowId) -> Result<()> {
        self.start_workflow_with(&CallContext::default(), workflow)
    }

    /// `created -> running`, followed by the first scheduling pass.
    pub fn start_workflow_with(&self, ctx: &CallContext, workflow: WorkflowId) -> Result<()> {
        self.idempotent("start_workflow", ctx, || {
            let slot = self.slot(workflow)?;
            {
                let mut scheduler = self.lock_structural(workflow, &slot)?;
                let (from, to) = scheduler.start()?;
                self.effects()
                    .publish_workflow_change(&scheduler, from, to, None);
            }
            self.schedule(workflow);
            Ok(())
        })
    }

    pub fn cancel_workflow(&self, workflow: WorkflowId) -> Result<()> {
        self.cancel_workflow_with(&CallContext::default(), workflow)
    }

    /// Mark the workflow canceled and cancel every member that can still be
    /// canceled. Members that reach a terminal state concurrently keep it.
    pub fn cancel_workflow_with(&self, ctx: &CallContext, workflow: WorkflowId) -> Result<()> {
        self.idempotent("cancel_workflow", ctx, || {
            let slot = self.slot(workflow)?;
            {
                let mut scheduler = self.lock_structural(workflow, &slot)?;
                let (from, members) = scheduler.cancel()?;
                self.effects().publish_workflow_change(
                    &scheduler,
                    from,
                    WorkflowStatus::Canceled,
                    ctx.principal.as_ref().map(|p| format!("canceled by {p}")),
                );

                let mut canceled = 0usize;
                for task in members {
                    let reason = StatusReason::WorkflowCanceled { workflow };
                    match self
                        .inner
                        .store
                        .cancel(task, Some(reason), ctx.principal.clone())
                    {
                        Ok(_) => canceled += 1,
                        Err(OrchestratorError::TaskNotCancelable { state, .. }) => {
                            debug!(%workflow, %task, %state, "member already settled; kept");
                        }
                        Err(err) => warn!(%workflow, %task, error = %err, "failed to cancel member"),
                    }
                }
                info!(%workflow, canceled, "workflow members canceled");
            }
            self.schedule(workflow);
            Ok(())
        })
    }

    /// Status of the workflow and all of its members.
    pub fn workflow_status(&self, workflow: WorkflowId) -> Result<WorkflowReport> {
        self.with_scheduler(workflow, |scheduler| {
            let view = self.view_of(scheduler);
            scheduler.report(&view)
        })
    }

    /// Task id of the member registered under `key`.
    pub fn workflow_task(&self, workflow: WorkflowId, key: &str) -> Result<TaskId> {
        self.with_scheduler(workflow, |scheduler| scheduler.task_id(key))?
            .ok_or_else(|| OrchestratorError::UnknownTaskKey(key.to_string()))
    }

    pub fn workflows(&self) -> Vec<WorkflowId> {
        self.inner.workflows.iter().map(|e| *e.key()).collect()
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    /// Subscribe to events matching `filter`, optionally replaying from
    /// `from_sequence`. Must be called from within a tokio runtime.
    pub fn subscribe(
        &self,
        filter: impl Into<SubscriptionFilter>,
        from_sequence: Option<u64>,
    ) -> Result<SubscriptionHandle> {
        self.inner.subscriptions.subscribe(filter, from_sequence)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscriptions.unsubscribe(id)
    }

    pub fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.subscriptions.list()
    }

    // ---------------------------------------------------------------------
    // Scheduling internals
    // ---------------------------------------------------------------------

    fn effects(&self) -> StepEffects<'_> {
        StepEffects {
            store: &self.inner.store,
            bus: &self.inner.bus,
            starter: self.inner.starter.as_ref(),
            membership: &self.inner.membership,
        }
    }

    fn slot(&self, workflow: WorkflowId) -> Result<Arc<WorkflowSlot>> {
        self.inner
            .workflows
            .get(&workflow)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or(OrchestratorError::WorkflowNotFound(workflow))
    }

    /// Structural changes never wait for a pass in progress.
    fn lock_structural<'a>(
        &self,
        workflow: WorkflowId,
        slot: &'a WorkflowSlot,
    ) -> Result<MutexGuard<'a, WorkflowScheduler>> {
        match slot.scheduler.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                debug!(%workflow, "scheduling pass in progress; structural change refused");
                Err(OrchestratorError::SchedulingConflict(workflow))
            }
        }
    }

    /// Run `f` against the scheduler, waiting for any pass in progress, then
    /// drain passes requested meanwhile.
    fn with_scheduler<R>(
        &self,
        workflow: WorkflowId,
        f: impl FnOnce(&WorkflowScheduler) -> R,
    ) -> Result<R> {
        let slot = self.slot(workflow)?;
        let out = {
            let scheduler = lock(&slot.scheduler);
            f(&*scheduler)
        };
        if slot.dirty.load(Ordering::Acquire) {
            self.schedule(workflow);
        }
        Ok(out)
    }

    /// Reads the slot's gate snapshot, never the scheduler, so it does not
    /// wait for a pass (or deadlock inside a starter hook).
    fn check_completion_gates(&self, workflow: WorkflowId, task: TaskId) -> Result<()> {
        let slot = self.slot(workflow)?;
        let blockers = read(&slot.gates).blockers(task, |pred| self.inner.store.state_of(pred));

        if blockers.is_empty() {
            Ok(())
        } else {
            info!(%workflow, %task, waiting_on = blockers.len(), "completion blocked by finish gates");
            Err(OrchestratorError::CompletionBlocked {
                task,
                waiting_on: blockers,
            })
        }
    }

    fn view_of(&self, scheduler: &WorkflowScheduler) -> WorkflowView {
        scheduler
            .graph()
            .nodes()
            .iter()
            .filter_map(|id| {
                let task = self.inner.store.get(*id).ok()?;
                Some((*id, TaskView::from(task)))
            })
            .collect()
    }

    /// Request a scheduling pass and run it unless another caller already is.
    fn schedule(&self, workflow: WorkflowId) {
        let Ok(slot) = self.slot(workflow) else {
            return;
        };
        slot.dirty.store(true, Ordering::Release);

        loop {
            let mut scheduler = match slot.scheduler.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                // The holder re-checks `dirty` before it lets go.
                Err(TryLockError::WouldBlock) => return,
            };
            self.run_passes(&slot, &mut scheduler);
            drop(scheduler);

            if !slot.dirty.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn run_passes(&self, slot: &WorkflowSlot, scheduler: &mut WorkflowScheduler) {
        while slot.dirty.swap(false, Ordering::AcqRel) {
            let mut view = self.view_of(scheduler);
            let step = scheduler.reconcile(&mut view);
            if step.is_empty() {
                continue;
            }

            debug!(
                workflow = %scheduler.id(),
                eligible = step.newly_eligible.len(),
                canceled = step.newly_canceled.len(),
                skipped = step.newly_skipped.len(),
                spawn_iteration = ?step.spawn_iteration,
                "applying scheduling step"
            );
            if let Err(err) = event_handlers::apply_step(&self.effects(), scheduler, step) {
                warn!(workflow = %scheduler.id(), error = %err, "scheduling step partially applied");
            }
            slot.refresh_gates(scheduler);
            // Effects may have enabled more progress.
            slot.dirty.store(true, Ordering::Release);
        }
    }

    /// Run `op` once per idempotency key; repeats return the first successful
    /// outcome. Failures are not cached.
    fn idempotent<T, F>(&self, operation: &'static str, ctx: &CallContext, op: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T>,
    {
        match ctx.idempotency_key.as_deref() {
            Some(key) => self.inner.idempotency.run(format!("{operation}:{key}"), op),
            None => op(),
        }
    }
}
