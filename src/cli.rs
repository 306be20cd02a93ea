// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `a2a-orchestrator`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "a2a-orchestrator",
    version,
    about = "Run a multi-agent workflow definition against simulated agents.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the workflow definition (TOML).
    ///
    /// Default: `$A2A_ORCHESTRATOR_WORKFLOW`, else `workflow.toml` in the
    /// current working directory.
    #[arg(long, value_name = "PATH")]
    pub workflow: Option<PathBuf>,

    /// Parse + validate, print the graph in dependency order, but don't run
    /// anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `A2A_ORCHESTRATOR_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Cancel the workflow if it has not finished after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Print every event published while the workflow runs.
    #[arg(long)]
    pub events: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
