// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::dag::patterns::ITERATION_SEPARATOR;
use crate::errors::{OrchestratorError, Result};

/// Upper bound for the buffer and queue tunables.
pub const MAX_BUFFER_SIZE: usize = 1 << 20;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = OrchestratorError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

/// Re-run validation on an already checked config (after manual edits).
pub fn validate_config(cfg: &ConfigFile) -> Result<()> {
    validate_raw_config(&RawConfigFile {
        runtime: cfg.runtime.clone(),
        workflow: cfg.workflow.clone(),
        task: cfg.task.clone(),
        dependency: cfg.dependency.clone(),
    })
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_tasks(cfg)?;
    validate_runtime(cfg)?;
    validate_workflow(cfg)?;
    validate_task_keys(cfg)?;
    validate_dependencies(cfg)?;
    validate_dag(cfg)?;
    Ok(())
}

fn config_error(msg: impl Into<String>) -> OrchestratorError {
    OrchestratorError::ConfigError(msg.into())
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(config_error(
            "config must contain at least one [task.<key>] section",
        ));
    }
    Ok(())
}

fn validate_runtime(cfg: &RawConfigFile) -> Result<()> {
    let bounded = [
        ("replay_buffer_size", cfg.runtime.replay_buffer_size),
        (
            "subscriber_queue_capacity",
            cfg.runtime.subscriber_queue_capacity,
        ),
        ("idempotency_cache_size", cfg.runtime.idempotency_cache_size),
    ];
    for (name, value) in bounded {
        if value == 0 || value > MAX_BUFFER_SIZE {
            return Err(config_error(format!(
                "[runtime].{name} must be between 1 and {MAX_BUFFER_SIZE} (got {value})"
            )));
        }
    }
    Ok(())
}

fn validate_workflow(cfg: &RawConfigFile) -> Result<()> {
    if cfg.workflow.name.trim().is_empty() {
        return Err(config_error("[workflow].name must not be empty"));
    }
    if let Some(spec) = &cfg.workflow.loop_spec {
        if spec.max_iterations == 0 {
            return Err(config_error("[workflow.loop].max_iterations must be >= 1"));
        }
        if let Some(until) = &spec.until {
            until
                .validate()
                .map_err(|e| config_error(format!("[workflow.loop].until: {e}")))?;
        }
    }
    Ok(())
}

fn validate_task_keys(cfg: &RawConfigFile) -> Result<()> {
    for key in cfg.task.keys() {
        if key.contains(ITERATION_SEPARATOR) {
            return Err(config_error(format!(
                "task key '{key}' must not contain '{ITERATION_SEPARATOR}'"
            )));
        }
    }
    Ok(())
}

fn validate_dependencies(cfg: &RawConfigFile) -> Result<()> {
    for dep in &cfg.dependency {
        for key in [&dep.from, &dep.to] {
            if !cfg.task.contains_key(key) {
                return Err(config_error(format!(
                    "dependency {} -> {} refers to unknown task '{key}'",
                    dep.from, dep.to
                )));
            }
        }
        if dep.from == dep.to {
            return Err(config_error(format!(
                "task '{}' cannot depend on itself",
                dep.from
            )));
        }
        if let Some(condition) = &dep.condition {
            condition.validate().map_err(|e| {
                config_error(format!("condition on {} -> {}: {e}", dep.from, dep.to))
            })?;
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: from -> to, whatever the dependency kind.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for key in cfg.task.keys() {
        graph.add_node(key.as_str());
    }
    for dep in &cfg.dependency {
        graph.add_edge(dep.from.as_str(), dep.to.as_str(), ());
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(config_error(format!(
            "cycle detected in workflow graph involving task '{}'",
            cycle.node_id()
        ))),
    }
}
