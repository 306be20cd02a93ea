// src/exec/backend.rs

//! Pluggable agent backend abstraction.
//!
//! The runtime talks to an `AgentBackend` instead of calling agents
//! directly. This makes it easy to swap in a fake agent in tests while
//! keeping the simulated agent used by the CLI in [`SimulatedAgentBackend`].
//!
//! A backend receives tasks that are already `working` and reports each
//! outcome back as a [`RuntimeEvent::AgentReported`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ConfigFile, SimulatedOutcome, TaskConfig};
use crate::dag::patterns::template_key;
use crate::engine::{AgentOutcome, EligibleTask, RuntimeEvent};
use crate::errors::Result;

/// Trait abstracting how picked-up tasks are worked on.
pub trait AgentBackend: Send {
    /// Hand one task to an agent.
    ///
    /// The implementation is free to:
    /// - forward the task to a remote A2A agent
    /// - simulate the work and emit `RuntimeEvent`s (CLI, tests)
    fn dispatch(
        &mut self,
        task: EligibleTask,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Agent stand-in driven by the `[task.<key>]` simulation fields.
///
/// Each dispatched task sleeps for its `delay_ms` on a spawned tokio task and
/// then reports its configured outcome. Loop instances use the settings of
/// their template key.
pub struct SimulatedAgentBackend {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    tasks: HashMap<String, TaskConfig>,
}

impl SimulatedAgentBackend {
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>, tasks: HashMap<String, TaskConfig>) -> Self {
        Self { runtime_tx, tasks }
    }

    pub fn from_config(runtime_tx: mpsc::Sender<RuntimeEvent>, cfg: &ConfigFile) -> Self {
        let tasks = cfg
            .task
            .iter()
            .map(|(key, task)| (key.clone(), task.clone()))
            .collect();
        Self::new(runtime_tx, tasks)
    }

    fn outcome_for(&self, task: &EligibleTask) -> (Duration, AgentOutcome) {
        let Some(config) = self.tasks.get(template_key(&task.key)) else {
            warn!(key = %task.key, "no simulation settings for task; completing it");
            return (Duration::ZERO, AgentOutcome::Completed(None));
        };

        let payload = config.result_for(task.iteration);
        let outcome = match config.outcome {
            SimulatedOutcome::Complete => AgentOutcome::Completed(payload),
            SimulatedOutcome::Fail => AgentOutcome::Failed(payload),
        };
        (Duration::from_millis(config.delay_ms), outcome)
    }
}

impl AgentBackend for SimulatedAgentBackend {
    fn dispatch(
        &mut self,
        task: EligibleTask,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let (delay, outcome) = self.outcome_for(&task);
        // Clone the sender so the spawned work doesn't borrow `self`.
        let tx = self.runtime_tx.clone();

        Box::pin(async move {
            debug!(task = %task.task_id, key = %task.key, ?delay, "simulated agent working");
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let event = RuntimeEvent::AgentReported {
                    task: task.task_id,
                    outcome,
                };
                if tx.send(event).await.is_err() {
                    debug!(task = %task.task_id, "runtime gone; simulated outcome dropped");
                }
            });
            Ok(())
        })
    }
}
