// src/dag/scheduler.rs

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dag::graph::DependencyGraph;
use crate::dag::patterns::{self, DependencySpec, LoopSpec, PatternPlan, PatternTag, TaskSpec};
use crate::dag::report::{CollateralCancel, MemberReport, WorkflowReport};
use crate::dag::scheduler_step::SchedulerStep;
use crate::dag::state_manager::{CompletionGates, ReadOnlyStateManager, StateManager};
use crate::dag::task_info::{MemberInfo, PlannedTask, WorkflowView};
use crate::dag::{Dependency, DependencyKind};
use crate::errors::{OrchestratorError, Result};
use crate::task::TaskState;
use crate::types::{ContextId, FailurePolicy, TaskId, WorkflowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    Canceled,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Canceled | WorkflowStatus::Failed
        )
    }

    /// Members and dependencies may be added.
    pub fn is_mutable(self) -> bool {
        matches!(self, WorkflowStatus::Created | WorkflowStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Created => "created",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Canceled => "canceled",
            WorkflowStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_version() -> String {
    "1".to_string()
}

/// Static description of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub pattern: PatternTag,
    /// Falls back to the orchestrator's configured default when absent.
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
    /// Context for members that do not name their own. A fresh one is
    /// generated when absent.
    #[serde(default)]
    pub context_id: Option<ContextId>,
    /// Present for loop workflows: the task specs become the loop template.
    #[serde(default, rename = "loop")]
    pub loop_spec: Option<LoopSpec>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            pattern: PatternTag::default(),
            failure_policy: None,
            context_id: None,
            loop_spec: None,
        }
    }

    /// Definition matching a pattern builder's output.
    pub fn for_plan(name: impl Into<String>, plan: &PatternPlan) -> Self {
        Self {
            pattern: plan.pattern,
            loop_spec: plan.loop_spec.clone(),
            ..Self::new(name)
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    /// Effective failure policy.
    pub fn policy(&self) -> FailurePolicy {
        self.failure_policy.unwrap_or_default()
    }

    pub fn context(mut self, context_id: impl Into<ContextId>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }
}

#[derive(Debug, Clone)]
struct LoopState {
    spec: LoopSpec,
    tasks: Vec<TaskSpec>,
    dependencies: Vec<DependencySpec>,
    iteration: u32,
    sinks: Vec<TaskId>,
    /// Last sink of the current iteration in declaration order; `until` is
    /// evaluated on its result.
    watched: Option<TaskId>,
    spawn_pending: bool,
    finished: bool,
}

impl LoopState {
    fn source_keys(&self) -> Vec<&str> {
        let targets: HashSet<&str> = self.dependencies.iter().map(|d| d.to.as_str()).collect();
        self.tasks
            .iter()
            .map(|t| t.key.as_str())
            .filter(|k| !targets.contains(k))
            .collect()
    }

    fn sink_keys(&self) -> Vec<&str> {
        let origins: HashSet<&str> = self.dependencies.iter().map(|d| d.from.as_str()).collect();
        self.tasks
            .iter()
            .map(|t| t.key.as_str())
            .filter(|k| !origins.contains(k))
            .collect()
    }
}

/// Scheduling state of one workflow.
///
/// This is the pure core: it never touches the task store or the bus. Each
/// [`WorkflowScheduler::reconcile`] call takes a snapshot of member states and
/// returns a [`SchedulerStep`] describing what the caller should apply.
#[derive(Debug, Clone)]
pub struct WorkflowScheduler {
    id: WorkflowId,
    definition: WorkflowDefinition,
    context_id: ContextId,
    status: WorkflowStatus,
    graph: DependencyGraph,
    members: HashMap<TaskId, MemberInfo>,
    keys: HashMap<String, TaskId>,
    looping: Option<LoopState>,
}

impl WorkflowScheduler {
    /// Validate a definition with its tasks and dependencies and reserve ids
    /// for every member. Nothing is created anywhere; the caller creates the
    /// returned tasks once planning succeeded.
    pub fn plan(
        id: WorkflowId,
        definition: WorkflowDefinition,
        tasks: Vec<TaskSpec>,
        dependencies: Vec<DependencySpec>,
    ) -> Result<(Self, Vec<PlannedTask>)> {
        let context_id = definition.context_id.clone().unwrap_or_default();
        let mut scheduler = Self {
            id,
            definition,
            context_id,
            status: WorkflowStatus::Created,
            graph: DependencyGraph::new(id),
            members: HashMap::new(),
            keys: HashMap::new(),
            looping: None,
        };

        let planned = match scheduler.definition.loop_spec.clone() {
            Some(spec) => {
                if spec.max_iterations == 0 {
                    return Err(OrchestratorError::ConfigError(
                        "loop max_iterations must be at least 1".to_string(),
                    ));
                }
                if tasks.is_empty() {
                    return Err(OrchestratorError::ConfigError(
                        "loop template has no tasks".to_string(),
                    ));
                }
                let template_keys: HashSet<&str> = tasks.iter().map(|t| t.key.as_str()).collect();
                for dep in &dependencies {
                    for key in [&dep.from, &dep.to] {
                        if !template_keys.contains(key.as_str()) {
                            return Err(OrchestratorError::UnknownTaskKey(key.clone()));
                        }
                    }
                }

                scheduler.looping = Some(LoopState {
                    spec,
                    tasks,
                    dependencies,
                    iteration: 0,
                    sinks: Vec::new(),
                    watched: None,
                    spawn_pending: false,
                    finished: false,
                });
                scheduler.instantiate_iteration(1)?
            }
            None => {
                let planned = tasks
                    .into_iter()
                    .map(|spec| scheduler.add_member(spec, None))
                    .collect::<Result<Vec<_>>>()?;
                for spec in &dependencies {
                    scheduler.add_dependency_spec(spec)?;
                }
                planned
            }
        };

        debug!(
            workflow = %id,
            tasks = planned.len(),
            edges = scheduler.graph.edge_count(),
            "workflow planned"
        );
        Ok((scheduler, planned))
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn context_id(&self) -> &ContextId {
        &self.context_id
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.members.contains_key(&task)
    }

    pub fn member(&self, task: TaskId) -> Option<&MemberInfo> {
        self.members.get(&task)
    }

    /// Members in declaration order.
    pub fn members(&self) -> impl Iterator<Item = &MemberInfo> {
        self.graph.nodes().iter().filter_map(|id| self.members.get(id))
    }

    pub fn task_id(&self, key: &str) -> Option<TaskId> {
        self.keys.get(key).copied()
    }

    pub fn iteration(&self) -> Option<u32> {
        self.looping.as_ref().map(|l| l.iteration)
    }

    fn ensure_mutable(&self, operation: &'static str) -> Result<()> {
        if self.status.is_mutable() {
            Ok(())
        } else {
            Err(OrchestratorError::WorkflowNotMutable {
                workflow: self.id,
                status: self.status,
                operation,
            })
        }
    }

    fn resolve_key(&self, key: &str) -> Result<TaskId> {
        self.task_id(key)
            .ok_or_else(|| OrchestratorError::UnknownTaskKey(key.to_string()))
    }

    /// Register a new member and reserve its task id.
    pub fn add_member(&mut self, spec: TaskSpec, iteration: Option<u32>) -> Result<PlannedTask> {
        self.ensure_mutable("add a task")?;
        if spec.key.is_empty() {
            return Err(OrchestratorError::ConfigError(
                "task key must not be empty".to_string(),
            ));
        }
        if self.keys.contains_key(&spec.key) {
            return Err(OrchestratorError::ConfigError(format!(
                "duplicate task key {:?} in workflow {}",
                spec.key, self.id
            )));
        }

        let id = TaskId::new();
        self.graph.add_node(id);
        self.members
            .insert(id, MemberInfo::new(id, spec.key.clone(), iteration));
        self.keys.insert(spec.key.clone(), id);

        Ok(PlannedTask {
            id,
            key: spec.key,
            context_id: spec.context_id.unwrap_or_else(|| self.context_id.clone()),
            agent: spec.agent,
            input: spec.input,
            iteration,
        })
    }

    /// Add an edge between two members.
    ///
    /// An edge added to a running workflow does not revoke an eligibility
    /// signal its dependent already received.
    pub fn add_dependency(&mut self, dependency: Dependency) -> Result<()> {
        self.ensure_mutable("add a dependency")?;
        if let Some(condition) = &dependency.condition {
            condition
                .validate()
                .map_err(OrchestratorError::ConfigError)?;
        }

        let (from, to, kind) = (dependency.from, dependency.to, dependency.kind);
        self.graph.add_dependency(dependency)?;
        debug!(workflow = %self.id, %from, %to, %kind, "dependency added");
        Ok(())
    }

    pub fn add_dependency_spec(&mut self, spec: &DependencySpec) -> Result<()> {
        let from = self.resolve_key(&spec.from)?;
        let to = self.resolve_key(&spec.to)?;
        self.add_dependency(Dependency {
            from,
            to,
            kind: spec.kind,
            condition: spec.condition.clone(),
        })
    }

    /// Instantiate loop iteration `n`: template members keyed `key#n`, the
    /// template's edges, and finish-to-start edges from every sink of the
    /// previous iteration to every source of this one.
    pub fn instantiate_iteration(&mut self, n: u32) -> Result<Vec<PlannedTask>> {
        let Some(state) = self.looping.as_ref() else {
            return Ok(Vec::new());
        };
        let tasks = state.tasks.clone();
        let dependencies = state.dependencies.clone();
        let source_keys: Vec<String> = state.source_keys().into_iter().map(String::from).collect();
        let sink_keys: Vec<String> = state.sink_keys().into_iter().map(String::from).collect();
        let previous_sinks = state.sinks.clone();

        let mut planned = Vec::with_capacity(tasks.len());
        for spec in tasks {
            let key = patterns::iteration_key(&spec.key, n);
            planned.push(self.add_member(TaskSpec { key, ..spec }, Some(n))?);
        }
        for dep in &dependencies {
            self.add_dependency_spec(&DependencySpec {
                from: patterns::iteration_key(&dep.from, n),
                to: patterns::iteration_key(&dep.to, n),
                ..dep.clone()
            })?;
        }

        let sources = source_keys
            .iter()
            .map(|k| self.resolve_key(&patterns::iteration_key(k, n)))
            .collect::<Result<Vec<_>>>()?;
        let sinks = sink_keys
            .iter()
            .map(|k| self.resolve_key(&patterns::iteration_key(k, n)))
            .collect::<Result<Vec<_>>>()?;

        for sink in &previous_sinks {
            for source in &sources {
                self.add_dependency(Dependency::new(
                    *sink,
                    *source,
                    DependencyKind::FinishToStart,
                ))?;
            }
        }

        if let Some(state) = self.looping.as_mut() {
            state.iteration = n;
            state.watched = sinks.last().copied();
            state.sinks = sinks;
            state.spawn_pending = false;
        }

        info!(workflow = %self.id, iteration = n, tasks = planned.len(), "loop iteration instantiated");
        Ok(planned)
    }

    /// `created -> running`.
    pub fn start(&mut self) -> Result<(WorkflowStatus, WorkflowStatus)> {
        if self.status != WorkflowStatus::Created {
            return Err(OrchestratorError::WorkflowNotMutable {
                workflow: self.id,
                status: self.status,
                operation: "start",
            });
        }
        self.status = WorkflowStatus::Running;
        info!(workflow = %self.id, name = %self.definition.name, "workflow started");
        Ok((WorkflowStatus::Created, WorkflowStatus::Running))
    }

    /// Mark the workflow canceled. Returns the previous status and the members
    /// the caller should try to cancel.
    pub fn cancel(&mut self) -> Result<(WorkflowStatus, Vec<TaskId>)> {
        if self.status.is_terminal() {
            return Err(OrchestratorError::WorkflowNotMutable {
                workflow: self.id,
                status: self.status,
                operation: "cancel",
            });
        }
        let from = self.status;
        self.status = WorkflowStatus::Canceled;
        if let Some(state) = self.looping.as_mut() {
            state.finished = true;
        }
        info!(workflow = %self.id, %from, "workflow canceled");
        Ok((from, self.graph.nodes().to_vec()))
    }

    /// Forget a collateral cancellation the store refused (the task had
    /// already moved on).
    pub fn clear_collateral(&mut self, task: TaskId) {
        if let Some(member) = self.members.get_mut(&task) {
            member.collateral = None;
        }
    }

    /// One scheduling pass over `view`.
    ///
    /// Resolves conditions, cascades failures (block policy), propagates
    /// skips, signals newly eligible tasks, advances loops and finally decides
    /// completion. Tasks the pass cancels are marked canceled in `view` so the
    /// rest of the pass sees them settled.
    pub fn reconcile(&mut self, view: &mut WorkflowView) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if self.status != WorkflowStatus::Running {
            return step;
        }

        let order = match self.graph.topological_order() {
            Ok(order) => order,
            Err(err) => {
                warn!(workflow = %self.id, error = %err, "graph not acyclic; using declaration order");
                self.graph.nodes().to_vec()
            }
        };
        let policy = self.definition.policy();

        let settled = {
            let mut manager = StateManager::new(&mut self.graph, &mut self.members, view, policy);
            manager.resolve_conditions();
            if policy == FailurePolicy::Block {
                step.newly_canceled = manager.cascade_failures(&order);
            }
            step.newly_skipped = manager.propagate_skips(&order);
            step.newly_eligible = manager.collect_eligible(&order);
            manager.all_settled()
        };

        if let Some(next) = self.next_iteration(view) {
            step.spawn_iteration = Some(next);
            return step;
        }

        if settled && !self.looping.as_ref().is_some_and(|l| l.spawn_pending) {
            let root_failures =
                ReadOnlyStateManager::new(&self.graph, &self.members, view, policy).root_failures();
            let to = if policy == FailurePolicy::Block && !root_failures.is_empty() {
                WorkflowStatus::Failed
            } else {
                WorkflowStatus::Completed
            };
            info!(
                workflow = %self.id,
                status = %to,
                root_failures = root_failures.len(),
                "all members settled; workflow finished"
            );
            step.status_change = Some((self.status, to));
            self.status = to;
        }

        step
    }

    /// Decide whether the loop needs another iteration.
    fn next_iteration(&mut self, view: &WorkflowView) -> Option<u32> {
        let state = self.looping.as_mut()?;
        if state.finished || state.spawn_pending {
            return None;
        }
        let watched = state.watched?;

        let skipped = self.members.get(&watched).is_some_and(|m| m.skipped);
        let task = view.get(&watched);
        let task_state = task.map(|t| t.state).unwrap_or(TaskState::Unknown);

        if skipped || task_state.is_unsuccessful() {
            debug!(workflow = %self.id, iteration = state.iteration, "loop stopped: iteration did not complete");
            state.finished = true;
            return None;
        }
        if task_state != TaskState::Completed {
            return None;
        }

        let result = task.and_then(|t| t.result.as_ref()).unwrap_or(&Value::Null);
        if state.spec.until.as_ref().is_some_and(|c| c.evaluate(Some(result))) {
            info!(workflow = %self.id, iteration = state.iteration, "loop condition satisfied");
            state.finished = true;
            return None;
        }
        if state.iteration >= state.spec.max_iterations {
            info!(workflow = %self.id, iteration = state.iteration, "loop reached max iterations");
            state.finished = true;
            return None;
        }

        state.spawn_pending = true;
        Some(state.iteration + 1)
    }

    /// Predecessors that still block `task` from completing.
    pub fn completion_blockers(&self, task: TaskId, view: &WorkflowView) -> Vec<TaskId> {
        self.completion_gates().blockers(task, |pred| {
            view.get(&pred).map(|v| v.state).unwrap_or(TaskState::Unknown)
        })
    }

    /// Snapshot of the finish gates, for checks made without this scheduler.
    pub fn completion_gates(&self) -> CompletionGates {
        let view = WorkflowView::new();
        ReadOnlyStateManager::new(&self.graph, &self.members, &view, self.definition.policy())
            .completion_gates()
    }

    pub fn report(&self, view: &WorkflowView) -> WorkflowReport {
        let policy = self.definition.policy();
        let ro = ReadOnlyStateManager::new(&self.graph, &self.members, view, policy);

        let tasks: Vec<MemberReport> = self
            .members()
            .map(|m| MemberReport {
                id: m.id,
                key: m.key.clone(),
                state: ro.state(m.id),
                eligible: m.signaled,
                skipped: m.skipped,
                iteration: m.iteration,
            })
            .collect();

        WorkflowReport {
            id: self.id,
            name: self.definition.name.clone(),
            version: self.definition.version.clone(),
            pattern: self.definition.pattern,
            failure_policy: policy,
            context_id: self.context_id.clone(),
            status: self.status,
            root_failures: ro.root_failures(),
            collateral: self
                .members()
                .filter_map(|m| {
                    m.collateral.map(|upstream| CollateralCancel {
                        task: m.id,
                        upstream,
                    })
                })
                .collect(),
            skipped: self.members().filter(|m| m.skipped).map(|m| m.id).collect(),
            iteration: self.iteration(),
            tasks,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::dag::Condition;
    use crate::dag::task_info::TaskView;

    fn plan(
        definition: WorkflowDefinition,
        tasks: &[&str],
        deps: Vec<DependencySpec>,
    ) -> (WorkflowScheduler, WorkflowView) {
        let specs = tasks.iter().map(|k| TaskSpec::new(*k)).collect();
        let (scheduler, planned) =
            WorkflowScheduler::plan(WorkflowId::new(), definition, specs, deps).unwrap();
        let view = planned
            .iter()
            .map(|p| (p.id, TaskView::new(TaskState::Submitted)))
            .collect();
        (scheduler, view)
    }

    fn id(s: &WorkflowScheduler, key: &str) -> TaskId {
        s.task_id(key).unwrap()
    }

    fn set(view: &mut WorkflowView, task: TaskId, state: TaskState) {
        view.insert(task, TaskView::new(state));
    }

    fn complete(view: &mut WorkflowView, task: TaskId, result: Value) {
        view.insert(
            task,
            TaskView {
                state: TaskState::Completed,
                result: Some(result),
                started: true,
            },
        );
    }

    #[test]
    fn finish_to_start_chain_runs_in_order_and_completes() {
        let (mut s, mut view) = plan(
            WorkflowDefinition::new("chain"),
            &["a", "b"],
            vec![DependencySpec::finish_to_start("a", "b")],
        );
        let (a, b) = (id(&s, "a"), id(&s, "b"));

        s.start().unwrap();
        let step = s.reconcile(&mut view);
        assert_eq!(step.newly_eligible, vec![a]);

        set(&mut view, a, TaskState::Working);
        assert!(s.reconcile(&mut view).is_empty());

        complete(&mut view, a, json!(null));
        assert_eq!(s.reconcile(&mut view).newly_eligible, vec![b]);

        set(&mut view, b, TaskState::Completed);
        let step = s.reconcile(&mut view);
        assert_eq!(
            step.status_change,
            Some((WorkflowStatus::Running, WorkflowStatus::Completed))
        );
        assert_eq!(s.status(), WorkflowStatus::Completed);
    }

    #[test]
    fn nothing_is_signalled_before_start() {
        let (mut s, mut view) = plan(WorkflowDefinition::new("idle"), &["a"], vec![]);
        assert!(s.reconcile(&mut view).is_empty());
        assert!(s.start().is_ok());
        assert!(matches!(
            s.start(),
            Err(OrchestratorError::WorkflowNotMutable { operation: "start", .. })
        ));
    }

    #[test]
    fn block_policy_cancels_transitive_dependents_with_root_cause() {
        let (mut s, mut view) = plan(
            WorkflowDefinition::new("block"),
            &["a", "b", "c", "side"],
            vec![
                DependencySpec::finish_to_start("a", "b"),
                DependencySpec::finish_to_start("b", "c"),
            ],
        );
        let (a, b, c, side) = (id(&s, "a"), id(&s, "b"), id(&s, "c"), id(&s, "side"));
        s.start().unwrap();
        s.reconcile(&mut view);

        set(&mut view, a, TaskState::Working);
        set(&mut view, side, TaskState::Working);
        set(&mut view, a, TaskState::Failed);
        let step = s.reconcile(&mut view);

        let mut canceled = step.newly_canceled.clone();
        canceled.sort();
        let mut expected = vec![(b, a), (c, a)];
        expected.sort();
        assert_eq!(canceled, expected);
        // `side` is still working, so the workflow is not finished yet.
        assert_eq!(step.status_change, None);

        set(&mut view, side, TaskState::Completed);
        let step = s.reconcile(&mut view);
        assert_eq!(
            step.status_change,
            Some((WorkflowStatus::Running, WorkflowStatus::Failed))
        );

        let report = s.report(&view);
        assert_eq!(report.root_failures, vec![a]);
        assert_eq!(report.upstream_of(c), Some(a));
    }

    #[test]
    fn continue_policy_lets_dependents_run_and_completes() {
        let (mut s, mut view) = plan(
            WorkflowDefinition::new("continue").failure_policy(FailurePolicy::Continue),
            &["a", "b"],
            vec![DependencySpec::finish_to_start("a", "b")],
        );
        let (a, b) = (id(&s, "a"), id(&s, "b"));
        s.start().unwrap();
        s.reconcile(&mut view);

        set(&mut view, a, TaskState::Failed);
        let step = s.reconcile(&mut view);
        assert!(step.newly_canceled.is_empty());
        assert_eq!(step.newly_eligible, vec![b]);

        set(&mut view, b, TaskState::Completed);
        let step = s.reconcile(&mut view);
        assert_eq!(
            step.status_change,
            Some((WorkflowStatus::Running, WorkflowStatus::Completed))
        );
        assert_eq!(s.report(&view).root_failures, vec![a]);
    }

    #[test]
    fn start_to_start_waits_for_predecessor_to_begin() {
        let (mut s, mut view) = plan(
            WorkflowDefinition::new("ss"),
            &["a", "b"],
            vec![DependencySpec::new("a", "b", DependencyKind::StartToStart)],
        );
        let (a, b) = (id(&s, "a"), id(&s, "b"));
        s.start().unwrap();
        assert_eq!(s.reconcile(&mut view).newly_eligible, vec![a]);

        set(&mut view, a, TaskState::Working);
        assert_eq!(s.reconcile(&mut view).newly_eligible, vec![b]);
    }

    #[test]
    fn start_to_start_dependent_of_rejected_task_is_canceled() {
        let (mut s, mut view) = plan(
            WorkflowDefinition::new("ss-reject"),
            &["a", "b"],
            vec![DependencySpec::new("a", "b", DependencyKind::StartToStart)],
        );
        let (a, b) = (id(&s, "a"), id(&s, "b"));
        s.start().unwrap();
        s.reconcile(&mut view);

        set(&mut view, a, TaskState::Rejected);
        let step = s.reconcile(&mut view);
        assert!(step.newly_eligible.is_empty());
        assert_eq!(step.newly_canceled, vec![(b, a)]);
        assert_eq!(
            step.status_change,
            Some((WorkflowStatus::Running, WorkflowStatus::Failed))
        );
    }

    #[test]
    fn start_to_start_needs_a_predecessor_that_actually_ran() {
        let (s, mut view) = plan(
            WorkflowDefinition::new("ss-view"),
            &["a", "b"],
            vec![DependencySpec::new("a", "b", DependencyKind::StartToStart)],
        );
        let (a, b) = (id(&s, "a"), id(&s, "b"));
        let members: HashMap<TaskId, MemberInfo> =
            s.members().map(|m| (m.id, m.clone())).collect();

        view.insert(a, TaskView::new(TaskState::Canceled));
        let ro = ReadOnlyStateManager::new(s.graph(), &members, &view, FailurePolicy::Block);
        assert!(!ro.start_satisfied(b));

        let mut ran = TaskView::new(TaskState::Canceled);
        ran.started = true;
        view.insert(a, ran);
        let ro = ReadOnlyStateManager::new(s.graph(), &members, &view, FailurePolicy::Block);
        assert!(ro.start_satisfied(b));
    }

    #[test]
    fn finish_gates_only_block_completion() {
        let (mut s, mut view) = plan(
            WorkflowDefinition::new("gates"),
            &["a", "b", "c"],
            vec![
                DependencySpec::new("a", "b", DependencyKind::FinishToFinish),
                DependencySpec::new("a", "c", DependencyKind::StartToFinish),
            ],
        );
        let (a, b, c) = (id(&s, "a"), id(&s, "b"), id(&s, "c"));
        s.start().unwrap();
        let mut eligible = s.reconcile(&mut view).newly_eligible;
        eligible.sort();
        let mut all = vec![a, b, c];
        all.sort();
        assert_eq!(eligible, all);

        assert_eq!(s.completion_blockers(b, &view), vec![a]);
        assert_eq!(s.completion_blockers(c, &view), vec![a]);

        set(&mut view, a, TaskState::Working);
        assert_eq!(s.completion_blockers(b, &view), vec![a]);
        assert!(s.completion_blockers(c, &view).is_empty());

        set(&mut view, a, TaskState::Completed);
        assert!(s.completion_blockers(b, &view).is_empty());
    }

    #[test]
    fn false_condition_skips_branch_and_its_dependents() {
        let (mut s, mut view) = plan(
            WorkflowDefinition::new("cond"),
            &["review", "publish", "announce", "archive"],
            vec![
                DependencySpec::finish_to_start("review", "publish")
                    .when(Condition::truthy("/approved")),
                DependencySpec::finish_to_start("publish", "announce"),
                DependencySpec::finish_to_start("review", "archive"),
            ],
        );
        let review = id(&s, "review");
        let (publish, announce, archive) =
            (id(&s, "publish"), id(&s, "announce"), id(&s, "archive"));
        s.start().unwrap();
        s.reconcile(&mut view);

        complete(&mut view, review, json!({"approved": false}));
        let step = s.reconcile(&mut view);
        assert_eq!(step.newly_skipped, vec![publish, announce]);
        assert_eq!(step.newly_eligible, vec![archive]);

        set(&mut view, archive, TaskState::Completed);
        let step = s.reconcile(&mut view);
        assert_eq!(
            step.status_change,
            Some((WorkflowStatus::Running, WorkflowStatus::Completed))
        );
        assert_eq!(s.report(&view).skipped, vec![publish, announce]);
    }

    #[test]
    fn loop_spawns_until_condition_holds() {
        let definition = WorkflowDefinition {
            loop_spec: Some(LoopSpec {
                max_iterations: 5,
                until: Some(Condition::equals("/done", true)),
            }),
            ..WorkflowDefinition::new("loop")
        };
        let (mut s, mut view) = plan(
            definition,
            &["draft", "check"],
            vec![DependencySpec::finish_to_start("draft", "check")],
        );
        s.start().unwrap();
        assert_eq!(s.reconcile(&mut view).newly_eligible, vec![id(&s, "draft#1")]);

        complete(&mut view, id(&s, "draft#1"), json!(null));
        s.reconcile(&mut view);
        complete(&mut view, id(&s, "check#1"), json!({"done": false}));
        let step = s.reconcile(&mut view);
        assert_eq!(step.spawn_iteration, Some(2));
        assert_eq!(step.status_change, None);

        let planned = s.instantiate_iteration(2).unwrap();
        assert_eq!(planned.len(), 2);
        for p in &planned {
            view.insert(p.id, TaskView::new(TaskState::Submitted));
        }
        assert_eq!(s.graph().dependencies_of(id(&s, "draft#2")), vec![id(&s, "check#1")]);
        assert_eq!(s.reconcile(&mut view).newly_eligible, vec![id(&s, "draft#2")]);

        complete(&mut view, id(&s, "draft#2"), json!(null));
        s.reconcile(&mut view);
        complete(&mut view, id(&s, "check#2"), json!({"done": true}));
        let step = s.reconcile(&mut view);
        assert_eq!(step.spawn_iteration, None);
        assert_eq!(
            step.status_change,
            Some((WorkflowStatus::Running, WorkflowStatus::Completed))
        );
        assert_eq!(s.iteration(), Some(2));
    }

    #[test]
    fn loop_respects_max_iterations() {
        let definition = WorkflowDefinition {
            loop_spec: Some(LoopSpec {
                max_iterations: 1,
                until: None,
            }),
            ..WorkflowDefinition::new("once")
        };
        let (mut s, mut view) = plan(definition, &["step"], vec![]);
        s.start().unwrap();
        s.reconcile(&mut view);
        complete(&mut view, id(&s, "step#1"), json!(1));
        let step = s.reconcile(&mut view);
        assert_eq!(step.spawn_iteration, None);
        assert_eq!(s.status(), WorkflowStatus::Completed);
    }

    #[test]
    fn planning_rejects_unknown_keys_and_cycles() {
        let err = WorkflowScheduler::plan(
            WorkflowId::new(),
            WorkflowDefinition::new("bad"),
            vec![TaskSpec::new("a")],
            vec![DependencySpec::finish_to_start("a", "ghost")],
        )
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownTaskKey(k) if k == "ghost"));

        let err = WorkflowScheduler::plan(
            WorkflowId::new(),
            WorkflowDefinition::new("cyclic"),
            vec![TaskSpec::new("a"), TaskSpec::new("b")],
            vec![
                DependencySpec::finish_to_start("a", "b"),
                DependencySpec::finish_to_start("b", "a"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::CyclicDependency { .. }));
    }

    #[test]
    fn finished_workflows_reject_structural_changes() {
        let (mut s, _view) = plan(WorkflowDefinition::new("w"), &["a"], vec![]);
        let (from, members) = s.cancel().unwrap();
        assert_eq!(from, WorkflowStatus::Created);
        assert_eq!(members.len(), 1);

        assert!(matches!(
            s.add_member(TaskSpec::new("late"), None),
            Err(OrchestratorError::WorkflowNotMutable {
                status: WorkflowStatus::Canceled,
                ..
            })
        ));
        assert!(s.cancel().is_err());
    }
}
