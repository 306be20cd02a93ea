// src/dag/dependency.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dag::Condition;
use crate::types::TaskId;

/// How a dependency constrains its dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
    /// Dependent starts after the predecessor finished successfully.
    #[serde(alias = "fs")]
    FinishToStart,
    /// Dependent starts once the predecessor has started.
    #[serde(alias = "ss")]
    StartToStart,
    /// Dependent may start any time but completes only after the predecessor
    /// is terminal.
    #[serde(alias = "ff")]
    FinishToFinish,
    /// Dependent may start any time but completes only after the predecessor
    /// has started.
    #[serde(alias = "sf")]
    StartToFinish,
}

impl DependencyKind {
    pub fn gates_start(self) -> bool {
        matches!(
            self,
            DependencyKind::FinishToStart | DependencyKind::StartToStart
        )
    }

    pub fn gates_completion(self) -> bool {
        !self.gates_start()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DependencyKind::FinishToStart => "finish-to-start",
            DependencyKind::StartToStart => "start-to-start",
            DependencyKind::FinishToFinish => "finish-to-finish",
            DependencyKind::StartToFinish => "start-to-finish",
        }
    }
}

impl Default for DependencyKind {
    fn default() -> Self {
        DependencyKind::FinishToStart
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fs" | "finish-to-start" => Ok(DependencyKind::FinishToStart),
            "ss" | "start-to-start" => Ok(DependencyKind::StartToStart),
            "ff" | "finish-to-finish" => Ok(DependencyKind::FinishToFinish),
            "sf" | "start-to-finish" => Ok(DependencyKind::StartToFinish),
            other => Err(format!("invalid dependency kind: {other}")),
        }
    }
}

/// A typed edge `from -> to`: `to` depends on `from`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub from: TaskId,
    pub to: TaskId,
    pub kind: DependencyKind,
    pub condition: Option<Condition>,
}

impl Dependency {
    pub fn new(from: TaskId, to: TaskId, kind: DependencyKind) -> Self {
        Self {
            from,
            to,
            kind,
            condition: None,
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}
