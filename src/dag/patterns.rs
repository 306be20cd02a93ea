// src/dag/patterns.rs

//! Convenience constructors for common workflow shapes.
//!
//! Every pattern is only a way of producing task specs and dependency specs
//! for the one general scheduler; nothing downstream branches on the tag.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dag::{Condition, DependencyKind};
use crate::types::{ContextId, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternTag {
    Sequential,
    Parallel,
    Pipeline,
    FanOut,
    FanIn,
    Conditional,
    Loop,
    /// Hand-built graph.
    #[default]
    Custom,
}

impl fmt::Display for PatternTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PatternTag::Sequential => "sequential",
            PatternTag::Parallel => "parallel",
            PatternTag::Pipeline => "pipeline",
            PatternTag::FanOut => "fan-out",
            PatternTag::FanIn => "fan-in",
            PatternTag::Conditional => "conditional",
            PatternTag::Loop => "loop",
            PatternTag::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// A task to create as a workflow member. `key` names it within the
/// workflow; dependency specs refer to tasks by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub key: String,
    /// Defaults to the workflow's context.
    #[serde(default)]
    pub context_id: Option<ContextId>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub input: Option<Payload>,
}

impl TaskSpec {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn input(mut self, input: Payload) -> Self {
        self.input = Some(input);
        self
    }

    pub fn context(mut self, context_id: impl Into<ContextId>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }
}

/// A dependency between two task keys: `to` depends on `from`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub kind: DependencyKind,
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl DependencySpec {
    pub fn new(from: impl Into<String>, to: impl Into<String>, kind: DependencyKind) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind,
            condition: None,
        }
    }

    pub fn finish_to_start(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, DependencyKind::FinishToStart)
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Repeat a template subgraph.
///
/// Iteration `i + 1` is instantiated once the last sink of iteration `i`
/// completes, unless `until` holds on that sink's result or `max_iterations`
/// iterations already exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    pub max_iterations: u32,
    #[serde(default)]
    pub until: Option<Condition>,
}

/// Output of a pattern builder.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternPlan {
    pub pattern: PatternTag,
    pub tasks: Vec<TaskSpec>,
    pub dependencies: Vec<DependencySpec>,
    pub loop_spec: Option<LoopSpec>,
}

impl PatternPlan {
    fn new(pattern: PatternTag, tasks: Vec<TaskSpec>, dependencies: Vec<DependencySpec>) -> Self {
        Self {
            pattern,
            tasks,
            dependencies,
            loop_spec: None,
        }
    }
}

fn keys(tasks: &[TaskSpec]) -> Vec<String> {
    tasks.iter().map(|t| t.key.clone()).collect()
}

/// `a -> b -> c`, finish-to-start.
pub fn sequential(tasks: Vec<TaskSpec>) -> PatternPlan {
    let deps = keys(&tasks)
        .windows(2)
        .map(|w| DependencySpec::finish_to_start(&w[0], &w[1]))
        .collect();
    PatternPlan::new(PatternTag::Sequential, tasks, deps)
}

/// Independent tasks, all eligible at start.
pub fn parallel(tasks: Vec<TaskSpec>) -> PatternPlan {
    PatternPlan::new(PatternTag::Parallel, tasks, Vec::new())
}

/// Streaming stages: each stage starts once the previous one started and
/// finishes only after the previous one finished.
pub fn pipeline(stages: Vec<TaskSpec>) -> PatternPlan {
    let deps = keys(&stages)
        .windows(2)
        .flat_map(|w| {
            [
                DependencySpec::new(&w[0], &w[1], DependencyKind::StartToStart),
                DependencySpec::new(&w[0], &w[1], DependencyKind::FinishToFinish),
            ]
        })
        .collect();
    PatternPlan::new(PatternTag::Pipeline, stages, deps)
}

/// `source` first, then every branch.
pub fn fan_out(source: TaskSpec, branches: Vec<TaskSpec>) -> PatternPlan {
    let deps = branches
        .iter()
        .map(|b| DependencySpec::finish_to_start(&source.key, &b.key))
        .collect();
    let mut tasks = vec![source];
    tasks.extend(branches);
    PatternPlan::new(PatternTag::FanOut, tasks, deps)
}

/// Every branch, then `sink`.
pub fn fan_in(branches: Vec<TaskSpec>, sink: TaskSpec) -> PatternPlan {
    let deps = branches
        .iter()
        .map(|b| DependencySpec::finish_to_start(&b.key, &sink.key))
        .collect();
    let mut tasks = branches;
    tasks.push(sink);
    PatternPlan::new(PatternTag::FanIn, tasks, deps)
}

/// `gate` first; each branch runs only if its condition holds on the gate's
/// result. `otherwise` runs when none of them hold. Branches whose condition
/// fails are skipped, not failed.
pub fn conditional(
    gate: TaskSpec,
    branches: Vec<(Condition, TaskSpec)>,
    otherwise: Option<TaskSpec>,
) -> PatternPlan {
    let mut deps = Vec::new();
    let mut conditions = Vec::new();
    let mut tasks = vec![gate.clone()];

    for (condition, branch) in branches {
        deps.push(DependencySpec::finish_to_start(&gate.key, &branch.key).when(condition.clone()));
        conditions.push(condition);
        tasks.push(branch);
    }

    if let Some(fallback) = otherwise {
        let none_hold = Condition::Any { conditions }.negate();
        deps.push(DependencySpec::finish_to_start(&gate.key, &fallback.key).when(none_hold));
        tasks.push(fallback);
    }

    PatternPlan::new(PatternTag::Conditional, tasks, deps)
}

/// Repeat `body` (with its internal `dependencies`) per `spec`. Instance keys
/// are suffixed with `#<iteration>`, starting at `#1`.
pub fn loop_over(
    body: Vec<TaskSpec>,
    dependencies: Vec<DependencySpec>,
    spec: LoopSpec,
) -> PatternPlan {
    PatternPlan {
        pattern: PatternTag::Loop,
        tasks: body,
        dependencies,
        loop_spec: Some(spec),
    }
}

/// Separates a loop template key from its iteration number.
pub const ITERATION_SEPARATOR: char = '#';

/// Key of a loop template task within a given iteration.
pub fn iteration_key(key: &str, iteration: u32) -> String {
    format!("{key}{ITERATION_SEPARATOR}{iteration}")
}

/// Strip a `#<iteration>` suffix, if any.
pub fn template_key(key: &str) -> &str {
    match key.rsplit_once(ITERATION_SEPARATOR) {
        Some((base, n)) if n.parse::<u32>().is_ok() => base,
        _ => key,
    }
}
