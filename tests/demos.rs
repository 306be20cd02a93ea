// tests/demos.rs

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use a2a_orchestrator::config::{ConfigFile, load_and_validate};
use a2a_orchestrator::dag::{WorkflowReport, WorkflowStatus};
use a2a_orchestrator::engine::{ChannelStarter, Orchestrator, Runtime, RuntimeOptions};
use a2a_orchestrator::exec::SimulatedAgentBackend;
use a2a_orchestrator::task::TaskState;
use a2a_orchestrator_test_utils::{assert_status, init_tracing, with_timeout};

fn demo(name: &str) -> ConfigFile {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("demos")
        .join(name);
    load_and_validate(&path).unwrap_or_else(|e| panic!("{} should be valid: {e}", path.display()))
}

async fn run_simulated(cfg: &ConfigFile) -> WorkflowReport {
    let (starter, eligible_rx) = ChannelStarter::new();
    let orchestrator = Orchestrator::with_starter(cfg.runtime.clone(), Arc::new(starter));
    let workflow = orchestrator
        .create_workflow(cfg.workflow.clone(), cfg.task_specs(), cfg.dependency_specs())
        .unwrap();

    let (rt_tx, rt_rx) = mpsc::channel(64);
    let backend = SimulatedAgentBackend::from_config(rt_tx, cfg);
    let runtime = Runtime::new(
        orchestrator.clone(),
        workflow,
        eligible_rx,
        rt_rx,
        backend,
        RuntimeOptions::default(),
    );
    orchestrator.start_workflow(workflow).unwrap();
    with_timeout(runtime.run()).await.unwrap()
}

#[tokio::test]
async fn release_demo_publishes_after_approval() {
    init_tracing();
    let cfg = demo("release.toml");
    assert_eq!(cfg.runtime.replay_buffer_size, 128);

    let report = run_simulated(&cfg).await;

    assert_status(&report, WorkflowStatus::Completed);
    for key in ["build", "test", "audit", "publish", "notify"] {
        assert_eq!(report.state_of(key), Some(TaskState::Completed), "{key}");
    }
    assert!(report.skipped.is_empty());
}

#[tokio::test]
async fn review_loop_demo_stops_once_approved() {
    init_tracing();
    let cfg = demo("review-loop.toml");

    let report = run_simulated(&cfg).await;

    assert_status(&report, WorkflowStatus::Completed);
    assert_eq!(report.iteration, Some(2));
    let keys: Vec<&str> = report.tasks.iter().map(|t| t.key.as_str()).collect();
    assert_eq!(keys, vec!["draft#1", "review#1", "draft#2", "review#2"]);
}
