// src/dag/graph.rs

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::dag::{Condition, Dependency, DependencyKind};
use crate::errors::{OrchestratorError, Result};
use crate::types::{TaskId, WorkflowId};

/// Index of an edge within its graph. Stable for the graph's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(usize);

/// A dependency plus the cached outcome of its condition.
#[derive(Debug, Clone)]
pub struct Edge {
    pub dependency: Dependency,
    /// `Some` once the condition was evaluated. Always `None` for
    /// unconditional edges.
    resolved: Option<bool>,
}

impl Edge {
    pub fn from(&self) -> TaskId {
        self.dependency.from
    }

    pub fn to(&self) -> TaskId {
        self.dependency.to
    }

    pub fn kind(&self) -> DependencyKind {
        self.dependency.kind
    }

    pub fn condition(&self) -> Option<&Condition> {
        self.dependency.condition.as_ref()
    }

    pub fn resolved(&self) -> Option<bool> {
        self.resolved
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    incoming: Vec<EdgeId>,
    outgoing: Vec<EdgeId>,
}

/// Acyclic dependency graph of one workflow, keyed by task id.
///
/// Nodes remember insertion order so reports and frontier signals come out in
/// the order tasks were declared.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    workflow: WorkflowId,
    nodes: HashMap<TaskId, Node>,
    order: Vec<TaskId>,
    edges: Vec<Edge>,
}

impl DependencyGraph {
    pub fn new(workflow: WorkflowId) -> Self {
        Self {
            workflow,
            nodes: HashMap::new(),
            order: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Returns `false` if the node already existed.
    pub fn add_node(&mut self, id: TaskId) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(id, Node::default());
        self.order.push(id);
        true
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> &[TaskId] {
        &self.order
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &Edge)> {
        self.edges.iter().enumerate().map(|(i, e)| (EdgeId(i), e))
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0]
    }

    /// Add `dependency.from -> dependency.to`.
    ///
    /// Rejects the edge with `CyclicDependency`, leaving the graph unchanged,
    /// if `to` can already reach `from` (or they are the same task). Adding an
    /// edge identical to an existing one is a no-op.
    pub fn add_dependency(&mut self, dependency: Dependency) -> Result<EdgeId> {
        let Dependency { from, to, .. } = dependency;
        for id in [from, to] {
            if !self.contains(id) {
                return Err(OrchestratorError::TaskNotFound(id));
            }
        }

        if from == to || self.reaches(to, from) {
            debug!(workflow = %self.workflow, %from, %to, "rejecting dependency that closes a cycle");
            return Err(OrchestratorError::CyclicDependency {
                workflow: self.workflow,
                from,
                to,
            });
        }

        if let Some(existing) = self.outgoing(from).find(|(_, e)| e.dependency == dependency) {
            return Ok(existing.0);
        }

        let id = EdgeId(self.edges.len());
        self.edges.push(Edge {
            dependency,
            resolved: None,
        });
        if let Some(node) = self.nodes.get_mut(&from) {
            node.outgoing.push(id);
        }
        if let Some(node) = self.nodes.get_mut(&to) {
            node.incoming.push(id);
        }
        Ok(id)
    }

    /// Depth-first search along outgoing edges.
    fn reaches(&self, start: TaskId, target: TaskId) -> bool {
        let mut stack = vec![start];
        let mut visited = HashSet::new();

        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.extend(self.outgoing(id).map(|(_, e)| e.to()));
        }
        false
    }

    /// Edges into `id` (its dependencies).
    pub fn incoming(&self, id: TaskId) -> impl Iterator<Item = (EdgeId, &Edge)> {
        self.nodes
            .get(&id)
            .map(|n| n.incoming.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|e| (*e, &self.edges[e.0]))
    }

    /// Edges out of `id` (its dependents).
    pub fn outgoing(&self, id: TaskId) -> impl Iterator<Item = (EdgeId, &Edge)> {
        self.nodes
            .get(&id)
            .map(|n| n.outgoing.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|e| (*e, &self.edges[e.0]))
    }

    /// Distinct direct predecessors of `id`.
    pub fn dependencies_of(&self, id: TaskId) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        self.incoming(id)
            .map(|(_, e)| e.from())
            .filter(|t| seen.insert(*t))
            .collect()
    }

    /// Distinct direct dependents of `id`.
    pub fn dependents_of(&self, id: TaskId) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        self.outgoing(id)
            .map(|(_, e)| e.to())
            .filter(|t| seen.insert(*t))
            .collect()
    }

    /// Nodes without dependencies.
    pub fn roots(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.incoming(*id).next().is_none())
            .collect()
    }

    /// Nodes without dependents.
    pub fn sinks(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.outgoing(*id).next().is_none())
            .collect()
    }

    /// Dependencies before dependents.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let mut graph: DiGraphMap<TaskId, ()> = DiGraphMap::new();
        for id in &self.order {
            graph.add_node(*id);
        }
        for edge in &self.edges {
            graph.add_edge(edge.from(), edge.to(), ());
        }

        toposort(&graph, None).map_err(|cycle| {
            let node = cycle.node_id();
            OrchestratorError::CyclicDependency {
                workflow: self.workflow,
                from: node,
                to: node,
            }
        })
    }

    /// Cache a condition outcome. The first resolution wins.
    pub fn resolve(&mut self, id: EdgeId, outcome: bool) -> bool {
        let edge = &mut self.edges[id.0];
        match edge.resolved {
            Some(previous) => previous,
            None => {
                edge.resolved = Some(outcome);
                outcome
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(n: usize) -> (DependencyGraph, Vec<TaskId>) {
        let mut graph = DependencyGraph::new(WorkflowId::new());
        let ids: Vec<TaskId> = (0..n).map(|_| TaskId::new()).collect();
        for id in &ids {
            graph.add_node(*id);
        }
        (graph, ids)
    }

    fn fs(from: TaskId, to: TaskId) -> Dependency {
        Dependency::new(from, to, DependencyKind::FinishToStart)
    }

    #[test]
    fn cycle_is_rejected_and_graph_unchanged() {
        let (mut graph, ids) = graph_with(3);
        graph.add_dependency(fs(ids[0], ids[1])).unwrap();
        graph.add_dependency(fs(ids[1], ids[2])).unwrap();

        let err = graph.add_dependency(fs(ids[2], ids[0])).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::CyclicDependency { from, to, .. } if from == ids[2] && to == ids[0]
        ));
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.dependents_of(ids[2]).is_empty());
    }

    #[test]
    fn self_loop_is_a_cycle_whatever_the_kind() {
        let (mut graph, ids) = graph_with(1);
        let dep = Dependency::new(ids[0], ids[0], DependencyKind::StartToFinish);
        assert!(matches!(
            graph.add_dependency(dep),
            Err(OrchestratorError::CyclicDependency { .. })
        ));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn unknown_nodes_are_rejected() {
        let (mut graph, ids) = graph_with(1);
        let stranger = TaskId::new();
        assert!(matches!(
            graph.add_dependency(fs(ids[0], stranger)),
            Err(OrchestratorError::TaskNotFound(id)) if id == stranger
        ));
    }

    #[test]
    fn duplicate_edges_collapse() {
        let (mut graph, ids) = graph_with(2);
        let a = graph.add_dependency(fs(ids[0], ids[1])).unwrap();
        let b = graph.add_dependency(fs(ids[0], ids[1])).unwrap();
        assert_eq!(a, b);
        assert_eq!(graph.edge_count(), 1);

        graph
            .add_dependency(Dependency::new(ids[0], ids[1], DependencyKind::FinishToFinish))
            .unwrap();
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.dependencies_of(ids[1]), vec![ids[0]]);
    }

    #[test]
    fn roots_sinks_and_topological_order() {
        let (mut graph, ids) = graph_with(4);
        // diamond: 0 -> {1, 2} -> 3
        graph.add_dependency(fs(ids[0], ids[1])).unwrap();
        graph.add_dependency(fs(ids[0], ids[2])).unwrap();
        graph.add_dependency(fs(ids[1], ids[3])).unwrap();
        graph.add_dependency(fs(ids[2], ids[3])).unwrap();

        assert_eq!(graph.roots(), vec![ids[0]]);
        assert_eq!(graph.sinks(), vec![ids[3]]);

        let order = graph.topological_order().unwrap();
        let pos = |id: TaskId| order.iter().position(|t| *t == id).unwrap();
        assert!(pos(ids[0]) < pos(ids[1]));
        assert!(pos(ids[0]) < pos(ids[2]));
        assert!(pos(ids[1]) < pos(ids[3]));
        assert!(pos(ids[2]) < pos(ids[3]));
    }

    #[test]
    fn first_resolution_sticks() {
        let (mut graph, ids) = graph_with(2);
        let edge = graph
            .add_dependency(fs(ids[0], ids[1]).when(Condition::Always))
            .unwrap();
        assert_eq!(graph.edge(edge).resolved(), None);
        assert!(!graph.resolve(edge, false));
        assert!(!graph.resolve(edge, true));
        assert_eq!(graph.edge(edge).resolved(), Some(false));
    }
}
