// tests/config_errors.rs

use std::io::Write;
use std::sync::Arc;

use serde_json::json;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

use a2a_orchestrator::config::{RuntimeConfig, load_and_validate};
use a2a_orchestrator::dag::{WorkflowDefinition, WorkflowStatus};
use a2a_orchestrator::engine::{ChannelStarter, Orchestrator, Runtime, RuntimeOptions};
use a2a_orchestrator::errors::OrchestratorError;
use a2a_orchestrator::exec::SimulatedAgentBackend;
use a2a_orchestrator::task::TaskState;
use a2a_orchestrator::types::FailurePolicy;
use a2a_orchestrator_test_utils::builders::{ConfigFileBuilder, TaskConfigBuilder};
use a2a_orchestrator_test_utils::{assert_status, init_tracing, with_timeout};

fn workflow_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn expect_config_error(contents: &str) -> String {
    match load_and_validate(workflow_file(contents).path()) {
        Err(OrchestratorError::ConfigError(msg)) => msg,
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_cycle_returns_config_error() {
    let msg = expect_config_error(
        r#"
[workflow]
name = "cyclic"

[task.A]
[task.B]

[[dependency]]
from = "A"
to = "B"

[[dependency]]
from = "B"
to = "A"
kind = "ss"
"#,
    );
    assert!(msg.contains("cycle detected"));
    assert!(msg.contains('A') || msg.contains('B'));
}

#[test]
fn test_unknown_dependency_key() {
    let msg = expect_config_error(
        r#"
[workflow]
name = "dangling"

[task.A]

[[dependency]]
from = "A"
to = "NonExistent"
"#,
    );
    assert!(msg.contains("unknown task"));
    assert!(msg.contains("NonExistent"));
}

#[test]
fn test_self_dependency() {
    let msg = expect_config_error(
        r#"
[workflow]
name = "selfish"

[task.A]

[[dependency]]
from = "A"
to = "A"
"#,
    );
    assert!(msg.contains("cannot depend on itself"));
}

#[test]
fn test_zero_replay_buffer() {
    let msg = expect_config_error(
        r#"
[runtime]
replay_buffer_size = 0

[workflow]
name = "no-buffer"

[task.A]
"#,
    );
    assert!(msg.contains("replay_buffer_size"));
}

#[test]
fn test_zero_idempotency_cache() {
    let msg = expect_config_error(
        r#"
[runtime]
idempotency_cache_size = 0

[workflow]
name = "forgetful"

[task.A]
"#,
    );
    assert!(msg.contains("idempotency_cache_size"));
}

#[test]
fn test_bad_condition_regex() {
    let msg = expect_config_error(
        r#"
[workflow]
name = "regex"

[task.A]
[task.B]

[[dependency]]
from = "A"
to = "B"
condition = { op = "matches", pointer = "/label", pattern = "(" }
"#,
    );
    assert!(msg.contains("A -> B"));
    assert!(msg.contains("invalid regex"));
}

#[test]
fn test_iteration_separator_in_key() {
    let msg = expect_config_error(
        r#"
[workflow]
name = "hash"

[task."draft#1"]
"#,
    );
    assert!(msg.contains("draft#1"));
}

#[test]
fn test_empty_task_table() {
    let msg = expect_config_error(
        r#"
[workflow]
name = "empty"
"#,
    );
    assert!(msg.contains("at least one"));
}

#[test]
fn test_malformed_toml_is_a_toml_error() {
    let result = load_and_validate(workflow_file("[workflow\nname = 1").path());
    assert!(matches!(result, Err(OrchestratorError::TomlError(_))));
}

#[test]
fn test_missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = load_and_validate(dir.path().join("missing.toml"));
    assert!(matches!(result, Err(OrchestratorError::IoError(_))));
}

#[test]
fn test_builder_rejects_zero_loop_iterations() {
    let result = ConfigFileBuilder::new("loop")
        .with_task("draft", TaskConfigBuilder::new().build())
        .with_loop(a2a_orchestrator::dag::LoopSpec {
            max_iterations: 0,
            until: None,
        })
        .try_build();
    assert!(matches!(result, Err(OrchestratorError::ConfigError(_))));
}

#[tokio::test]
async fn test_valid_file_runs_with_simulated_agents() {
    init_tracing();
    let file = workflow_file(
        r#"
[runtime]
replay_buffer_size = 32
default_failure_policy = "continue"

[workflow]
name = "review"

[task.lint]
agent = "linter"
result = { clean = true }

[task.tests]
agent = "tester"
outcome = "fail"
result = "flaky"
delay_ms = 5

[task.report]
agent = "reporter"

[[dependency]]
from = "lint"
to = "report"

[[dependency]]
from = "tests"
to = "report"
kind = "fs"
"#,
    );
    let cfg = load_and_validate(file.path()).unwrap();
    assert_eq!(cfg.runtime.replay_buffer_size, 32);
    assert_eq!(cfg.workflow.failure_policy, None);

    let (starter, eligible_rx) = ChannelStarter::new();
    let orchestrator = Orchestrator::with_starter(cfg.runtime.clone(), Arc::new(starter));
    let workflow = orchestrator
        .create_workflow(cfg.workflow.clone(), cfg.task_specs(), cfg.dependency_specs())
        .unwrap();

    let (rt_tx, rt_rx) = mpsc::channel(16);
    let backend = SimulatedAgentBackend::from_config(rt_tx, &cfg);
    let runtime = Runtime::new(
        orchestrator.clone(),
        workflow,
        eligible_rx,
        rt_rx,
        backend,
        RuntimeOptions::default(),
    );
    orchestrator.start_workflow(workflow).unwrap();

    let report = with_timeout(runtime.run()).await.unwrap();

    // Continue policy: the failed tester does not hold back the report.
    assert_status(&report, WorkflowStatus::Completed);
    assert_eq!(report.failure_policy, FailurePolicy::Continue);
    assert_eq!(report.state_of("tests"), Some(TaskState::Failed));
    assert_eq!(report.state_of("report"), Some(TaskState::Completed));

    let lint = orchestrator.workflow_task(workflow, "lint").unwrap();
    let lint = orchestrator.get_task(lint).unwrap();
    assert_eq!(lint.result, Some(json!({"clean": true})));
    assert_eq!(lint.agent.as_deref(), Some("linter"));
}

#[test]
fn test_runtime_defaults_apply_when_section_is_missing() {
    let file = workflow_file(
        r#"
[workflow]
name = "defaults"

[task.only]
"#,
    );
    let cfg = load_and_validate(file.path()).unwrap();
    assert_eq!(cfg.runtime, RuntimeConfig::default());
    assert_eq!(
        cfg.workflow,
        WorkflowDefinition::new("defaults")
    );
}
