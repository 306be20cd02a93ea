// src/engine/mod.rs

//! Orchestration engine.
//!
//! This module ties together:
//! - the [`Orchestrator`] facade over the task store, the event bus, the
//!   subscription manager and one scheduler per workflow
//! - the effects of a scheduling pass (`event_handlers`)
//! - the [`TaskStarter`] hook through which eligible tasks leave the core
//! - an async agent shell ([`Runtime`]) that picks up eligible tasks,
//!   hands them to an [`crate::exec::AgentBackend`] and reports outcomes
//!   back through the orchestrator.

use crate::types::{Payload, TaskId};

/// What an agent reported for a task it worked on.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    /// Finished; the payload becomes the task result.
    Completed(Option<Payload>),
    /// Gave up; the payload becomes the task error.
    Failed(Option<Payload>),
}

/// Runtime options for the agent shell.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// Cancel the workflow when a shutdown is requested, instead of leaving
    /// it running.
    pub cancel_on_shutdown: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            cancel_on_shutdown: true,
        }
    }
}

/// Events flowing into the runtime from agent backends and signal handlers.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// An agent finished working on a task.
    AgentReported { task: TaskId, outcome: AgentOutcome },
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

pub(crate) mod event_handlers;
mod idempotency;
pub mod orchestrator;
pub mod runtime;
pub mod starter;

pub use orchestrator::Orchestrator;
pub use runtime::Runtime;
pub use starter::{ChannelStarter, EligibleTask, NoopStarter, TaskStarter};
