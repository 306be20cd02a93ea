// tests/properties.rs

use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;

use a2a_orchestrator::dag::{
    Dependency, DependencyGraph, DependencyKind, DependencySpec, TaskSpec, WorkflowDefinition,
    WorkflowStatus,
};
use a2a_orchestrator::engine::Orchestrator;
use a2a_orchestrator::errors::OrchestratorError;
use a2a_orchestrator::events::Subject;
use a2a_orchestrator::task::TaskState;
use a2a_orchestrator::types::{TaskId, WorkflowId};

// Acyclic edge sets: every edge points from a lower index to a higher one.
fn dag_strategy(max_nodes: usize) -> impl Strategy<Value = (usize, BTreeSet<(usize, usize)>)> {
    (2..=max_nodes).prop_flat_map(|n| {
        proptest::collection::vec((0..n, 0..n), 0..(n * 2)).prop_map(move |pairs| {
            let edges = pairs
                .into_iter()
                .filter(|(a, b)| a != b)
                .map(|(a, b)| (a.min(b), a.max(b)))
                .collect();
            (n, edges)
        })
    })
}

fn state_strategy() -> impl Strategy<Value = TaskState> {
    proptest::sample::select(TaskState::ALL.to_vec())
}

fn key(i: usize) -> String {
    format!("t{i}")
}

proptest! {
    #[test]
    fn transitions_follow_the_table_and_terminal_states_stick(
        requested in proptest::collection::vec(state_strategy(), 1..24)
    ) {
        let o = Orchestrator::default();
        let task = o.create_task("ctx-prop");
        let mut current = TaskState::Submitted;
        let mut accepted = 0u64;

        for to in requested {
            let allowed = current.can_transition_to(to);
            let outcome = o.transition_task(task, to, None);
            prop_assert_eq!(outcome.is_ok(), allowed, "{} -> {}", current, to);

            if allowed {
                current = to;
                accepted += 1;
            } else {
                let is_invalid_transition = matches!(
                    outcome,
                    Err(OrchestratorError::InvalidTransition { .. })
                );
                prop_assert!(is_invalid_transition);
            }
            prop_assert_eq!(o.task_state(task), current);
        }

        if current.is_terminal() {
            for to in TaskState::ALL {
                prop_assert!(o.transition_task(task, to, None).is_err());
            }
            prop_assert_eq!(o.task_state(task), current);
        }

        // One event per accepted transition, numbered from 1.
        prop_assert_eq!(o.bus().head(Subject::Task(task)), accepted);
    }

    #[test]
    fn closing_an_edge_backwards_is_rejected_without_side_effects(
        (n, edges) in dag_strategy(8),
        pick in any::<prop::sample::Index>(),
    ) {
        prop_assume!(!edges.is_empty());

        let mut graph = DependencyGraph::new(WorkflowId::new());
        let ids: Vec<TaskId> = (0..n).map(|_| TaskId::new()).collect();
        for id in &ids {
            graph.add_node(*id);
        }
        for (a, b) in &edges {
            graph
                .add_dependency(Dependency::new(ids[*a], ids[*b], DependencyKind::FinishToStart))
                .unwrap();
        }
        let before = graph.edge_count();

        let edges: Vec<_> = edges.into_iter().collect();
        let (a, b) = edges[pick.index(edges.len())];
        for kind in [
            DependencyKind::FinishToStart,
            DependencyKind::StartToStart,
            DependencyKind::FinishToFinish,
            DependencyKind::StartToFinish,
        ] {
            let err = graph
                .add_dependency(Dependency::new(ids[b], ids[a], kind))
                .unwrap_err();
            let is_cycle = matches!(err, OrchestratorError::CyclicDependency { .. });
            prop_assert!(is_cycle);
            prop_assert_eq!(graph.edge_count(), before);
        }

        let order = graph.topological_order().unwrap();
        let position: HashMap<TaskId, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for (_, edge) in graph.edges() {
            prop_assert!(position[&edge.from()] < position[&edge.to()]);
        }
    }

    #[test]
    fn finish_to_start_members_only_become_eligible_after_their_predecessors(
        (n, edges) in dag_strategy(7)
    ) {
        let o = Orchestrator::default();
        let tasks = (0..n).map(|i| TaskSpec::new(key(i))).collect();
        let deps = edges
            .iter()
            .map(|(a, b)| DependencySpec::finish_to_start(key(*a), key(*b)))
            .collect();
        let wf = o
            .create_workflow(WorkflowDefinition::new("prop-fs"), tasks, deps)
            .unwrap();
        o.start_workflow(wf).unwrap();

        let mut finished: Vec<String> = Vec::new();
        for _ in 0..n {
            let report = o.workflow_status(wf).unwrap();
            let ready: Vec<String> = report
                .tasks
                .iter()
                .filter(|t| t.eligible && t.state == TaskState::Submitted)
                .map(|t| t.key.clone())
                .collect();
            prop_assert!(!ready.is_empty(), "no progress after {:?}", finished);

            for (a, b) in &edges {
                if ready.contains(&key(*b)) {
                    prop_assert!(finished.contains(&key(*a)));
                }
            }

            let next = &ready[0];
            let id = o.workflow_task(wf, next).unwrap();
            o.transition_task(id, TaskState::Working, None).unwrap();
            o.transition_task(id, TaskState::Completed, None).unwrap();
            finished.push(next.clone());
        }

        prop_assert_eq!(o.workflow_status(wf).unwrap().status, WorkflowStatus::Completed);
    }
}
