// src/exec/mod.rs

//! Agent execution layer.
//!
//! Responsibilities:
//! - Define the [`AgentBackend`] seam between the runtime and whatever does
//!   the actual work.
//! - Provide a [`SimulatedAgentBackend`] driven by the workflow file, used by
//!   the CLI to exercise a workflow end to end without real agents.

pub mod backend;

pub use backend::{AgentBackend, SimulatedAgentBackend};
