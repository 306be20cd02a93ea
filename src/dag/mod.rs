// src/dag/mod.rs

//! Workflow dependency graphs and scheduling.
//!
//! - [`graph`] holds the typed, acyclic dependency graph of one workflow.
//! - [`condition`] is the predicate language of conditional edges.
//! - [`scheduler`] contains the per-workflow state machine that decides
//!   which tasks are eligible, what a failure cancels and when the workflow
//!   is finished.
//! - [`state_manager`] implements the individual decisions of a pass.
//! - [`patterns`] builds task and dependency specs for common shapes.

pub mod condition;
pub mod dependency;
pub mod graph;
pub mod patterns;
pub mod report;
pub mod scheduler;
pub mod scheduler_step;
pub mod state_manager;
pub mod task_info;

pub use condition::Condition;
pub use dependency::{Dependency, DependencyKind};
pub use graph::DependencyGraph;
pub use patterns::{DependencySpec, LoopSpec, PatternPlan, PatternTag, TaskSpec};
pub use report::{CollateralCancel, MemberReport, WorkflowReport};
pub use scheduler::{WorkflowDefinition, WorkflowScheduler, WorkflowStatus};
pub use scheduler_step::SchedulerStep;
pub use state_manager::CompletionGates;
pub use task_info::{MemberInfo, PlannedTask, TaskView, WorkflowView};
