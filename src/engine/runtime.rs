// src/engine/runtime.rs

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dag::WorkflowReport;
use crate::errors::{OrchestratorError, Result};
use crate::exec::AgentBackend;
use crate::task::TaskState;
use crate::types::{CallContext, TaskId, WorkflowId};

use super::orchestrator::Orchestrator;
use super::starter::EligibleTask;
use super::{AgentOutcome, RuntimeEvent, RuntimeOptions};

/// Drives one workflow to a terminal status with a pluggable agent backend.
///
/// The scheduler only signals eligibility; this shell plays the agent side:
/// it moves each eligible task to `working`, hands it to the backend, and
/// applies the outcome the backend reports. Completions refused with
/// `CompletionBlocked` are retried after every later event.
pub struct Runtime<B: AgentBackend> {
    orchestrator: Orchestrator,
    workflow: WorkflowId,
    eligible_rx: mpsc::UnboundedReceiver<EligibleTask>,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    backend: B,
    options: RuntimeOptions,
    blocked: Vec<(TaskId, AgentOutcome)>,
}

impl<B: AgentBackend> fmt::Debug for Runtime<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("workflow", &self.workflow)
            .field("blocked", &self.blocked.len())
            .finish_non_exhaustive()
    }
}

impl<B: AgentBackend> Runtime<B> {
    pub fn new(
        orchestrator: Orchestrator,
        workflow: WorkflowId,
        eligible_rx: mpsc::UnboundedReceiver<EligibleTask>,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        backend: B,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            orchestrator,
            workflow,
            eligible_rx,
            event_rx,
            backend,
            options,
            blocked: Vec::new(),
        }
    }

    /// Main event loop. Returns the final report once the workflow reached a
    /// terminal status, or the current one if the loop had to stop early.
    pub async fn run(mut self) -> Result<WorkflowReport> {
        info!(workflow = %self.workflow, "agent runtime started");

        loop {
            if self.finished()? {
                break;
            }

            tokio::select! {
                Some(task) = self.eligible_rx.recv() => {
                    self.dispatch(task).await?;
                }
                event = self.event_rx.recv() => match event {
                    Some(RuntimeEvent::AgentReported { task, outcome }) => {
                        self.report(task, outcome);
                    }
                    Some(RuntimeEvent::ShutdownRequested) => {
                        info!(workflow = %self.workflow, "shutdown requested; stopping runtime");
                        self.shutdown();
                        break;
                    }
                    None => {
                        info!("runtime event channel closed; exiting");
                        break;
                    }
                },
            }

            self.retry_blocked();
        }

        let report = self.orchestrator.workflow_status(self.workflow)?;
        info!(workflow = %self.workflow, status = %report.status, "agent runtime exiting");
        Ok(report)
    }

    fn finished(&self) -> Result<bool> {
        Ok(self
            .orchestrator
            .workflow_status(self.workflow)?
            .status
            .is_terminal())
    }

    async fn dispatch(&mut self, task: EligibleTask) -> Result<()> {
        if task.workflow_id != self.workflow {
            debug!(task = %task.task_id, workflow = %task.workflow_id, "ignoring task of another workflow");
            return Ok(());
        }

        let ctx = CallContext::with_principal(task.agent.as_deref().unwrap_or("runtime"));
        match self
            .orchestrator
            .transition_task_with(&ctx, task.task_id, TaskState::Working, None)
        {
            Ok(_) => {}
            Err(err) => {
                // Typically canceled between the signal and the pickup.
                debug!(task = %task.task_id, key = %task.key, error = %err, "eligible task not picked up");
                return Ok(());
            }
        }

        debug!(task = %task.task_id, key = %task.key, "dispatching task to agent backend");
        self.backend.dispatch(task).await
    }

    fn report(&mut self, task: TaskId, outcome: AgentOutcome) {
        let ctx = CallContext::with_principal("runtime");
        let (to, payload) = match outcome.clone() {
            AgentOutcome::Completed(result) => (TaskState::Completed, result),
            AgentOutcome::Failed(error) => (TaskState::Failed, error),
        };

        match self.orchestrator.transition_task_with(&ctx, task, to, payload) {
            Ok(_) => {}
            Err(OrchestratorError::CompletionBlocked { waiting_on, .. }) => {
                debug!(%task, waiting_on = waiting_on.len(), "completion deferred");
                self.blocked.push((task, outcome));
            }
            Err(err) => warn!(%task, target = %to, error = %err, "agent outcome not applied"),
        }
    }

    fn retry_blocked(&mut self) {
        if self.blocked.is_empty() {
            return;
        }
        for (task, outcome) in std::mem::take(&mut self.blocked) {
            self.report(task, outcome);
        }
    }

    fn shutdown(&self) {
        if !self.options.cancel_on_shutdown {
            return;
        }
        if let Err(err) = self.orchestrator.cancel_workflow(self.workflow) {
            warn!(workflow = %self.workflow, error = %err, "failed to cancel workflow on shutdown");
        }
    }
}
