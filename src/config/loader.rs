// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Environment variable naming the workflow file when `--workflow` is not
/// given.
pub const WORKFLOW_PATH_ENV: &str = "A2A_ORCHESTRATOR_WORKFLOW";

/// Load a workflow file and return the raw, unvalidated model.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    debug!(path = %path.display(), bytes = contents.len(), "workflow file read");
    load_from_str(&contents)
}

pub fn load_from_str(contents: &str) -> Result<RawConfigFile> {
    let config: RawConfigFile = toml::from_str(contents)?;
    Ok(config)
}

/// Load a workflow file and validate it: known task keys, no
/// self-dependencies, no cycles, valid conditions and runtime bounds.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// `$A2A_ORCHESTRATOR_WORKFLOW`, else `workflow.toml` in the current
/// directory.
pub fn default_config_path() -> PathBuf {
    std::env::var_os(WORKFLOW_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("workflow.toml"))
}
