// src/config/model.rs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dag::{DependencySpec, TaskSpec, WorkflowDefinition};
use crate::types::{ContextId, FailurePolicy, Payload};

/// Workflow definition file as read from TOML, before validation.
///
/// ```toml
/// [runtime]
/// replay_buffer_size = 256
/// default_failure_policy = "block"
///
/// [workflow]
/// name = "release"
/// pattern = "fan-in"
///
/// [task.build]
/// agent = "builder"
///
/// [task.publish]
/// agent = "publisher"
///
/// [[dependency]]
/// from = "build"
/// to = "publish"
/// kind = "fs"
/// condition = { op = "truthy", pointer = "/ok" }
/// ```
///
/// Tasks are declared in key order.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    pub workflow: WorkflowDefinition,

    /// All tasks from `[task.<key>]`.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,

    /// All edges from `[[dependency]]`.
    #[serde(default)]
    pub dependency: Vec<DependencySpec>,
}

/// A [`RawConfigFile`] that passed validation. Build one with
/// `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub runtime: RuntimeConfig,
    pub workflow: WorkflowDefinition,
    pub task: BTreeMap<String, TaskConfig>,
    pub dependency: Vec<DependencySpec>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            runtime: raw.runtime,
            workflow: raw.workflow,
            task: raw.task,
            dependency: raw.dependency,
        }
    }

    pub fn task_specs(&self) -> Vec<TaskSpec> {
        self.task
            .iter()
            .map(|(key, task)| TaskSpec {
                key: key.clone(),
                context_id: task.context_id.clone(),
                agent: task.agent.clone(),
                input: task.input.clone(),
            })
            .collect()
    }

    pub fn dependency_specs(&self) -> Vec<DependencySpec> {
        self.dependency.clone()
    }
}

/// `[runtime]` section: tunables of the orchestration core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Events retained per subject for replay.
    pub replay_buffer_size: usize,
    /// Bounded queue in front of every subscriber.
    pub subscriber_queue_capacity: usize,
    /// Keep a per-task state history.
    pub track_history: bool,
    /// Policy for workflows whose definition does not name one.
    pub default_failure_policy: FailurePolicy,
    /// Idempotency keys remembered before the oldest is forgotten.
    pub idempotency_cache_size: usize,
}

pub const DEFAULT_REPLAY_BUFFER_SIZE: usize = 256;
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_IDEMPOTENCY_CACHE_SIZE: usize = 4096;

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            replay_buffer_size: DEFAULT_REPLAY_BUFFER_SIZE,
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            track_history: true,
            default_failure_policy: FailurePolicy::Block,
            idempotency_cache_size: DEFAULT_IDEMPOTENCY_CACHE_SIZE,
        }
    }
}

/// How the simulated agent finishes a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimulatedOutcome {
    #[default]
    Complete,
    Fail,
}

/// `[task.<key>]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TaskConfig {
    /// Routing label of the agent expected to do the work.
    #[serde(default)]
    pub agent: Option<String>,

    /// Input handed to the agent.
    #[serde(default)]
    pub input: Option<Payload>,

    /// Defaults to the workflow context.
    #[serde(default)]
    pub context_id: Option<ContextId>,

    /// Outcome reported when run with the simulated agent backend.
    #[serde(default)]
    pub outcome: SimulatedOutcome,

    /// Result (or error) payload reported by the simulated agent.
    #[serde(default)]
    pub result: Option<Payload>,

    /// Per-iteration results for loop templates; the last one repeats.
    /// Takes precedence over `result`.
    #[serde(default)]
    pub results: Vec<Payload>,

    /// Simulated work time in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
}

impl TaskConfig {
    /// Simulated payload for loop iteration `iteration` (1-based; `None`
    /// outside loops).
    pub fn result_for(&self, iteration: Option<u32>) -> Option<Payload> {
        if self.results.is_empty() {
            return self.result.clone();
        }
        let index = iteration.unwrap_or(1).saturating_sub(1) as usize;
        self.results
            .get(index)
            .or_else(|| self.results.last())
            .cloned()
    }
}
