#![allow(dead_code)]

use std::collections::BTreeMap;

use a2a_orchestrator::config::{ConfigFile, RawConfigFile, RuntimeConfig, SimulatedOutcome, TaskConfig};
use a2a_orchestrator::dag::{DependencySpec, LoopSpec, WorkflowDefinition};
use a2a_orchestrator::errors::Result;
use a2a_orchestrator::types::{FailurePolicy, Payload};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new(workflow: &str) -> Self {
        Self {
            config: RawConfigFile {
                runtime: RuntimeConfig::default(),
                workflow: WorkflowDefinition::new(workflow),
                task: BTreeMap::new(),
                dependency: Vec::new(),
            },
        }
    }

    pub fn with_task(mut self, key: &str, task: TaskConfig) -> Self {
        self.config.task.insert(key.to_string(), task);
        self
    }

    pub fn with_dependency(mut self, dependency: DependencySpec) -> Self {
        self.config.dependency.push(dependency);
        self
    }

    pub fn after(self, from: &str, to: &str) -> Self {
        self.with_dependency(DependencySpec::finish_to_start(from, to))
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.config.runtime = runtime;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.workflow.failure_policy = Some(policy);
        self
    }

    pub fn with_loop(mut self, spec: LoopSpec) -> Self {
        self.config.workflow.loop_spec = Some(spec);
        self
    }

    pub fn try_build(self) -> Result<ConfigFile> {
        ConfigFile::try_from(self.config)
    }

    pub fn build(self) -> ConfigFile {
        self.try_build()
            .expect("Failed to build valid config from builder")
    }
}

/// Builder for `TaskConfig`.
#[derive(Default)]
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, agent: &str) -> Self {
        self.task.agent = Some(agent.to_string());
        self
    }

    pub fn input(mut self, input: Payload) -> Self {
        self.task.input = Some(input);
        self
    }

    pub fn fail(mut self) -> Self {
        self.task.outcome = SimulatedOutcome::Fail;
        self
    }

    pub fn result(mut self, result: Payload) -> Self {
        self.task.result = Some(result);
        self
    }

    pub fn results(mut self, results: Vec<Payload>) -> Self {
        self.task.results = results;
        self
    }

    pub fn delay_ms(mut self, delay_ms: u64) -> Self {
        self.task.delay_ms = delay_ms;
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}
