// src/main.rs

use std::process::ExitCode;

use a2a_orchestrator::errors::OrchestratorError;
use a2a_orchestrator::{cli, logging, run};

/// Workflow ran but did not complete, or the runtime failed.
const EXIT_WORKFLOW: u8 = 1;
/// The workflow file could not be read or is invalid.
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    if let Err(err) = logging::init_logging(args.log_level) {
        eprintln!("a2a-orchestrator: {err:#}");
        return ExitCode::from(EXIT_CONFIG);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("a2a-orchestrator error: {err:?}");
            let config_problem = matches!(
                err.downcast_ref::<OrchestratorError>(),
                Some(
                    OrchestratorError::ConfigError(_)
                        | OrchestratorError::TomlError(_)
                        | OrchestratorError::IoError(_)
                )
            );
            ExitCode::from(if config_problem { EXIT_CONFIG } else { EXIT_WORKFLOW })
        }
    }
}
