// src/engine/event_handlers.rs

//! Applies the effects of a scheduling pass to the task store and the bus.
//!
//! The scheduler itself is pure: [`WorkflowScheduler::reconcile`] only
//! updates its own bookkeeping and returns a [`SchedulerStep`]. Everything
//! here runs while the caller still holds the workflow's scheduling lock.

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::dag::{PlannedTask, SchedulerStep, WorkflowScheduler, WorkflowStatus};
use crate::errors::{OrchestratorError, Result};
use crate::events::{Change, EventBus, EventDraft, Subject};
use crate::engine::starter::{EligibleTask, TaskStarter};
use crate::task::{NewTask, StatusReason, TaskStore};
use crate::types::{TaskId, WorkflowId};

/// Shared resources a step touches.
pub(crate) struct StepEffects<'a> {
    pub store: &'a TaskStore,
    pub bus: &'a EventBus,
    pub starter: &'a dyn TaskStarter,
    pub membership: &'a DashMap<TaskId, WorkflowId>,
}

impl StepEffects<'_> {
    /// Create planned members in the store and index them by workflow.
    pub fn create_members(
        &self,
        workflow: WorkflowId,
        planned: &[PlannedTask],
        principal: Option<String>,
    ) {
        for task in planned {
            self.store.create_with_id(
                task.id,
                task.context_id.clone(),
                NewTask {
                    agent: task.agent.clone(),
                    input: task.input.clone(),
                },
                principal.clone(),
            );
            self.membership.insert(task.id, workflow);
        }
    }

    pub fn publish_workflow_change(
        &self,
        scheduler: &WorkflowScheduler,
        from: WorkflowStatus,
        to: WorkflowStatus,
        reason: Option<String>,
    ) {
        let event = self.bus.publish(EventDraft {
            subject: Subject::Workflow(scheduler.id()),
            context_id: Some(scheduler.context_id().clone()),
            change: Change::Workflow { from, to },
            reason,
            payload: None,
        });
        debug!(workflow = %scheduler.id(), seq = event.seq, %from, %to, "workflow event published");
    }
}

/// Apply one step. Returns an error only if a loop iteration could not be
/// instantiated; every other effect is applied best-effort.
pub(crate) fn apply_step(
    fx: &StepEffects<'_>,
    scheduler: &mut WorkflowScheduler,
    step: SchedulerStep,
) -> Result<()> {
    handle_collateral(fx, scheduler, &step.newly_canceled);

    for task in &step.newly_skipped {
        debug!(workflow = %scheduler.id(), %task, "member skipped");
    }

    for task in &step.newly_eligible {
        handle_eligible(fx, scheduler, *task);
    }

    if let Some(n) = step.spawn_iteration {
        let planned = scheduler.instantiate_iteration(n).inspect_err(|err| {
            error!(workflow = %scheduler.id(), iteration = n, error = %err, "failed to instantiate loop iteration");
        })?;
        fx.create_members(scheduler.id(), &planned, None);
    }

    if let Some((from, to)) = step.status_change {
        let reason = (to == WorkflowStatus::Failed).then(|| "root task failure".to_string());
        fx.publish_workflow_change(scheduler, from, to, reason);
    }

    Ok(())
}

fn handle_collateral(
    fx: &StepEffects<'_>,
    scheduler: &mut WorkflowScheduler,
    canceled: &[(TaskId, TaskId)],
) {
    for (task, upstream) in canceled {
        let reason = StatusReason::UpstreamFailure {
            upstream: *upstream,
        };
        match fx.store.cancel(*task, Some(reason), None) {
            Ok(_) => {}
            Err(OrchestratorError::TaskNotCancelable { state, .. }) => {
                debug!(%task, %state, "collateral cancel lost the race; task already moved on");
                scheduler.clear_collateral(*task);
            }
            Err(err) => {
                warn!(%task, error = %err, "collateral cancel failed");
                scheduler.clear_collateral(*task);
            }
        }
    }
}

fn handle_eligible(fx: &StepEffects<'_>, scheduler: &WorkflowScheduler, task_id: TaskId) {
    let task = match fx.store.get(task_id) {
        Ok(task) => task,
        Err(err) => {
            warn!(task = %task_id, error = %err, "eligible member missing from store");
            return;
        }
    };
    let Some(member) = scheduler.member(task_id) else {
        return;
    };

    fx.bus.publish(EventDraft {
        subject: Subject::Task(task_id),
        context_id: Some(task.context_id.clone()),
        change: Change::TaskEligible {
            workflow: scheduler.id(),
        },
        reason: None,
        payload: None,
    });

    info!(workflow = %scheduler.id(), task = %task_id, key = %member.key, "signalling eligible task");
    fx.starter.task_eligible(EligibleTask {
        task_id,
        workflow_id: scheduler.id(),
        key: member.key.clone(),
        context_id: task.context_id,
        agent: task.agent,
        input: task.input,
        iteration: member.iteration,
    });
}
