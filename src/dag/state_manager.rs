// src/dag/state_manager.rs

//! Dependency satisfaction, failure cascades and skip propagation for one
//! scheduling pass.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dag::DependencyKind;
use crate::dag::graph::{DependencyGraph, EdgeId};
use crate::dag::task_info::{MemberInfo, TaskView, WorkflowView};
use crate::task::TaskState;
use crate::types::{FailurePolicy, TaskId};

static NO_RESULT: Value = Value::Null;

/// Mutating side of a pass: owns the decisions that change member
/// bookkeeping (and the pass-local view of task states).
pub struct StateManager<'a> {
    graph: &'a mut DependencyGraph,
    members: &'a mut HashMap<TaskId, MemberInfo>,
    view: &'a mut WorkflowView,
    policy: FailurePolicy,
}

impl<'a> StateManager<'a> {
    pub fn new(
        graph: &'a mut DependencyGraph,
        members: &'a mut HashMap<TaskId, MemberInfo>,
        view: &'a mut WorkflowView,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            graph,
            members,
            view,
            policy,
        }
    }

    fn read_only(&self) -> ReadOnlyStateManager<'_> {
        ReadOnlyStateManager::new(&*self.graph, &*self.members, &*self.view, self.policy)
    }

    /// Evaluate conditions whose predecessor settled since the last pass.
    ///
    /// A completed predecessor is judged on its result (or `null` if it has
    /// none); a predecessor that failed, was canceled or was skipped resolves
    /// every condition to false.
    pub fn resolve_conditions(&mut self) {
        let pending: Vec<(EdgeId, bool)> = self
            .graph
            .edges()
            .filter(|(_, e)| e.condition().is_some() && e.resolved().is_none())
            .filter_map(|(id, e)| {
                let from = e.from();
                let skipped = self.members.get(&from).is_some_and(|m| m.skipped);
                let view = self.view.get(&from);
                let state = view.map(|v| v.state).unwrap_or(TaskState::Unknown);
                if !state.is_terminal() && !skipped {
                    return None;
                }
                let result = match (state, view) {
                    (TaskState::Completed, Some(v)) => Some(v.result.as_ref().unwrap_or(&NO_RESULT)),
                    _ => None,
                };
                let outcome = e.condition().is_some_and(|c| c.evaluate(result));
                Some((id, outcome))
            })
            .collect();

        for (id, outcome) in pending {
            let outcome = self.graph.resolve(id, outcome);
            let edge = self.graph.edge(id);
            debug!(from = %edge.from(), to = %edge.to(), outcome, "condition resolved");
        }
    }

    /// Cancel every not-yet-started task reachable from an unsuccessful member,
    /// over edges of any kind. Traversal stops at tasks that already started.
    /// Collateral cancellations carry the original root cause.
    pub fn cascade_failures(&mut self, order: &[TaskId]) -> Vec<(TaskId, TaskId)> {
        let origins: Vec<(TaskId, TaskId)> = order
            .iter()
            .filter(|id| self.state(**id).is_unsuccessful())
            .map(|id| {
                let root = self.members.get(id).and_then(|m| m.collateral).unwrap_or(*id);
                (*id, root)
            })
            .collect();

        let mut canceled = Vec::new();
        for (origin, root) in origins {
            let mut stack = self.dependents(origin);
            while let Some(id) = stack.pop() {
                if self.state(id) != TaskState::Submitted {
                    continue;
                }
                let Some(member) = self.members.get_mut(&id) else {
                    warn!(task = %id, "graph node missing from members");
                    continue;
                };
                if member.skipped || member.collateral.is_some() {
                    continue;
                }

                member.collateral = Some(root);
                if let Some(view) = self.view.get_mut(&id) {
                    view.state = TaskState::Canceled;
                }
                info!(task = %id, upstream = %root, "canceling dependent after upstream failure");
                canceled.push((id, root));
                stack.extend(self.dependents(id));
            }
        }
        canceled
    }

    /// Mark tasks whose start can never be satisfied because of a condition
    /// that resolved false, or a start-gating predecessor that was skipped.
    /// `order` must be topological so skips propagate in a single sweep.
    pub fn propagate_skips(&mut self, order: &[TaskId]) -> Vec<TaskId> {
        let mut skipped = Vec::new();

        for id in order {
            if !self.is_waiting(*id) {
                continue;
            }
            let gated_off = self.graph.incoming(*id).any(|(_, e)| {
                e.resolved() == Some(false)
                    || (e.kind().gates_start()
                        && self.members.get(&e.from()).is_some_and(|m| m.skipped))
            });
            if gated_off {
                if let Some(member) = self.members.get_mut(id) {
                    member.skipped = true;
                    debug!(task = %id, key = %member.key, "task skipped by unsatisfied condition");
                }
                skipped.push(*id);
            }
        }
        skipped
    }

    /// Mark and return waiting tasks whose start dependencies are satisfied.
    pub fn collect_eligible(&mut self, order: &[TaskId]) -> Vec<TaskId> {
        let ready: Vec<TaskId> = {
            let ro = self.read_only();
            order
                .iter()
                .copied()
                .filter(|id| ro.is_waiting(*id) && ro.start_satisfied(*id))
                .collect()
        };

        for id in &ready {
            if let Some(member) = self.members.get_mut(id) {
                member.signaled = true;
                info!(task = %id, key = %member.key, "dependencies satisfied; task eligible");
            }
        }
        ready
    }

    pub fn all_settled(&self) -> bool {
        self.read_only().all_settled()
    }

    fn state(&self, id: TaskId) -> TaskState {
        self.read_only().state(id)
    }

    fn is_waiting(&self, id: TaskId) -> bool {
        self.read_only().is_waiting(id)
    }

    fn dependents(&self, id: TaskId) -> Vec<TaskId> {
        self.graph.outgoing(id).map(|(_, e)| e.to()).collect()
    }
}

/// Read-only checks over the same data, usable without a pass in progress
/// (completion gating, reports).
pub struct ReadOnlyStateManager<'a> {
    graph: &'a DependencyGraph,
    members: &'a HashMap<TaskId, MemberInfo>,
    view: &'a WorkflowView,
    policy: FailurePolicy,
}

impl<'a> ReadOnlyStateManager<'a> {
    pub fn new(
        graph: &'a DependencyGraph,
        members: &'a HashMap<TaskId, MemberInfo>,
        view: &'a WorkflowView,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            graph,
            members,
            view,
            policy,
        }
    }

    pub fn state(&self, id: TaskId) -> TaskState {
        self.view
            .get(&id)
            .map(|v: &TaskView| v.state)
            .unwrap_or(TaskState::Unknown)
    }

    /// Entered `working` at some point; leaving `submitted` through a cancel
    /// or a rejection does not count.
    fn has_run(&self, id: TaskId) -> bool {
        self.view.get(&id).is_some_and(|v| v.started)
    }

    fn is_skipped(&self, id: TaskId) -> bool {
        self.members.get(&id).is_some_and(|m| m.skipped)
    }

    /// Still `submitted`, not yet signalled, skipped or canceled by the
    /// scheduler.
    pub fn is_waiting(&self, id: TaskId) -> bool {
        self.state(id) == TaskState::Submitted
            && self
                .members
                .get(&id)
                .is_some_and(|m| !m.signaled && !m.skipped && m.collateral.is_none())
    }

    /// Whether every finish-to-start / start-to-start predecessor allows `id`
    /// to start, and every conditional edge into it resolved true. Under the
    /// continue policy an unsuccessful predecessor releases both kinds.
    pub fn start_satisfied(&self, id: TaskId) -> bool {
        self.graph.incoming(id).all(|(_, e)| {
            if e.condition().is_some() && e.resolved() != Some(true) {
                return false;
            }
            let pred = self.state(e.from());
            let released = self.policy == FailurePolicy::Continue && pred.is_unsuccessful();
            match e.kind() {
                DependencyKind::FinishToStart => pred == TaskState::Completed || released,
                DependencyKind::StartToStart => self.has_run(e.from()) || released,
                DependencyKind::FinishToFinish | DependencyKind::StartToFinish => true,
            }
        })
    }

    /// Finish-gating edges and skipped members as of now.
    pub fn completion_gates(&self) -> CompletionGates {
        let mut gates = CompletionGates::default();
        for (_, e) in self.graph.edges() {
            if e.kind().gates_completion() {
                gates.incoming.entry(e.to()).or_default().push((e.from(), e.kind()));
            }
        }
        gates.skipped = self
            .members
            .values()
            .filter(|m| m.skipped)
            .map(|m| m.id)
            .collect();
        gates
    }

    /// Every member terminal or skipped.
    pub fn all_settled(&self) -> bool {
        self.graph
            .nodes()
            .iter()
            .all(|id| self.state(*id).is_terminal() || self.is_skipped(*id))
    }

    /// Members that failed or were rejected on their own account.
    pub fn root_failures(&self) -> Vec<TaskId> {
        self.graph
            .nodes()
            .iter()
            .copied()
            .filter(|id| matches!(self.state(*id), TaskState::Failed | TaskState::Rejected))
            .collect()
    }
}

/// Copy of a workflow's finish-to-finish and start-to-finish edges, kept
/// outside the scheduler lock so completing a task never waits for a pass.
#[derive(Debug, Clone, Default)]
pub struct CompletionGates {
    incoming: HashMap<TaskId, Vec<(TaskId, DependencyKind)>>,
    skipped: HashSet<TaskId>,
}

impl CompletionGates {
    /// Predecessors that still prevent `task` from completing. Skipped
    /// predecessors never block.
    pub fn blockers(&self, task: TaskId, state_of: impl Fn(TaskId) -> TaskState) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        self.incoming
            .get(&task)
            .into_iter()
            .flatten()
            .filter(|&&(pred, kind)| {
                if self.skipped.contains(&pred) {
                    return false;
                }
                match kind {
                    DependencyKind::FinishToFinish => !state_of(pred).is_terminal(),
                    DependencyKind::StartToFinish => !state_of(pred).has_started(),
                    DependencyKind::FinishToStart | DependencyKind::StartToStart => false,
                }
            })
            .map(|&(pred, _)| pred)
            .filter(|pred| seen.insert(*pred))
            .collect()
    }

}
