pub mod builders;
pub mod fake_agent;

use std::sync::Once;
use std::time::Duration;

use a2a_orchestrator::dag::{WorkflowReport, WorkflowStatus};
use a2a_orchestrator::engine::Orchestrator;
use a2a_orchestrator::types::WorkflowId;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// Poll until the workflow reaches a terminal status and return its report.
pub async fn wait_until_finished(orchestrator: &Orchestrator, workflow: WorkflowId) -> WorkflowReport {
    with_timeout(async {
        loop {
            let report = orchestrator
                .workflow_status(workflow)
                .expect("workflow should exist");
            if report.status.is_terminal() {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// Shorthand for asserting a final status.
pub fn assert_status(report: &WorkflowReport, expected: WorkflowStatus) {
    assert_eq!(
        report.status, expected,
        "unexpected workflow status; report: {report:#?}"
    );
}
