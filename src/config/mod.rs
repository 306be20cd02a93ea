// src/config/mod.rs

//! Configuration loading and validation.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`): runtime tunables plus
//!   one workflow definition with its tasks and dependencies.
//! - Load a workflow file from disk (`loader.rs`).
//! - Validate invariants like graph acyclicity (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, load_from_str};
pub use model::{ConfigFile, RawConfigFile, RuntimeConfig, SimulatedOutcome, TaskConfig};
pub use validate::validate_config;
