// src/lib.rs

//! Multi-agent task orchestration core.
//!
//! Tasks move through an A2A-style state machine in the [`task`] store;
//! every change is sequenced per subject on the [`events`] bus and fanned out
//! to [`subscription`]s; workflows group tasks into typed dependency graphs
//! that the [`dag`] scheduler drives; [`engine::Orchestrator`] is the
//! external surface over all of it.

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod events;
pub mod exec;
pub mod logging;
pub mod subscription;
mod sync;
pub mod task;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::loader::{default_config_path, load_and_validate};
use crate::config::model::ConfigFile;
use crate::dag::{WorkflowReport, WorkflowScheduler, WorkflowStatus};
use crate::engine::{ChannelStarter, Orchestrator, Runtime, RuntimeEvent, RuntimeOptions};
use crate::exec::SimulatedAgentBackend;
use crate::subscription::{Delivery, SubscriptionFilter};
use crate::types::WorkflowId;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - workflow file loading
/// - orchestrator + channel starter
/// - simulated agent backend and the agent runtime
/// - optional event printer
/// - Ctrl-C and timeout handling
pub async fn run(args: CliArgs) -> Result<()> {
    let path = args.workflow.clone().unwrap_or_else(default_config_path);
    let cfg = load_and_validate(&path)?;
    info!(path = %path.display(), workflow = %cfg.workflow.name, "workflow file loaded");

    if args.dry_run {
        print_dry_run(&cfg)?;
        return Ok(());
    }

    let (starter, eligible_rx) = ChannelStarter::new();
    let orchestrator = Orchestrator::with_starter(cfg.runtime.clone(), Arc::new(starter));
    let workflow = orchestrator.create_workflow(
        cfg.workflow.clone(),
        cfg.task_specs(),
        cfg.dependency_specs(),
    )?;

    // Runtime event channel.
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(64);
    let backend = SimulatedAgentBackend::from_config(rt_tx.clone(), &cfg);

    let printer = if args.events {
        Some(spawn_event_printer(&orchestrator)?)
    } else {
        None
    };

    // Ctrl-C → graceful shutdown.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }

    if let Some(secs) = args.timeout_secs {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!(timeout_secs = secs, "workflow timed out; requesting shutdown");
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }
    drop(rt_tx);

    orchestrator.start_workflow(workflow)?;

    let runtime = Runtime::new(
        orchestrator.clone(),
        workflow,
        eligible_rx,
        rt_rx,
        backend,
        RuntimeOptions::default(),
    );
    let report = runtime.run().await?;

    if let Some(handle) = printer {
        // Let the printer drain what was already published.
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();
    }

    print_report(&report)?;
    finish(workflow, &report)
}

fn finish(workflow: WorkflowId, report: &WorkflowReport) -> Result<()> {
    match report.status {
        WorkflowStatus::Completed => Ok(()),
        status => anyhow::bail!(
            "workflow {workflow} ({}) ended {status}; root failures: {}",
            report.name,
            report.root_failures.len()
        ),
    }
}

/// Print every delivery as one JSON line on stdout.
fn spawn_event_printer(orchestrator: &Orchestrator) -> Result<JoinHandle<()>> {
    let mut handle = orchestrator.subscribe(SubscriptionFilter::all(), None)?;
    debug!(subscription = %handle.id(), "event printer subscribed");

    Ok(tokio::spawn(async move {
        while let Some(delivery) = handle.recv().await {
            let line = match &delivery {
                Delivery::Event(event) => serde_json::to_string(event),
                Delivery::Gap(gap) => serde_json::to_string(gap),
            };
            match line {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to serialise delivery"),
            }
        }
    }))
}

fn print_report(report: &WorkflowReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

/// Dry-run output: settings, then members in dependency order with their
/// incoming edges.
fn print_dry_run(cfg: &ConfigFile) -> Result<()> {
    let (scheduler, _planned) = WorkflowScheduler::plan(
        WorkflowId::new(),
        cfg.workflow.clone(),
        cfg.task_specs(),
        cfg.dependency_specs(),
    )?;
    let definition = scheduler.definition();

    println!("a2a-orchestrator dry-run");
    println!("  runtime.replay_buffer_size = {}", cfg.runtime.replay_buffer_size);
    println!(
        "  runtime.subscriber_queue_capacity = {}",
        cfg.runtime.subscriber_queue_capacity
    );
    println!("  runtime.track_history = {}", cfg.runtime.track_history);
    println!(
        "  runtime.idempotency_cache_size = {}",
        cfg.runtime.idempotency_cache_size
    );
    println!();
    println!("workflow {} v{}", definition.name, definition.version);
    println!("  pattern: {}", definition.pattern);
    println!(
        "  failure_policy: {}",
        definition
            .failure_policy
            .unwrap_or(cfg.runtime.default_failure_policy)
    );
    if let Some(spec) = &definition.loop_spec {
        println!("  loop: max_iterations = {}", spec.max_iterations);
        if let Some(until) = &spec.until {
            println!("  loop: until = {}", serde_json::to_string(until)?);
        }
    }
    println!();

    let order = scheduler.graph().topological_order()?;
    println!("tasks ({}):", order.len());
    for id in order {
        let Some(member) = scheduler.member(id) else {
            continue;
        };
        println!("  - {}", member.key);
        if let Some(task) = cfg.task.get(crate::dag::patterns::template_key(&member.key)) {
            if let Some(agent) = &task.agent {
                println!("      agent: {agent}");
            }
            if task.delay_ms > 0 {
                println!("      simulated delay: {}ms", task.delay_ms);
            }
        }
        for (_, edge) in scheduler.graph().incoming(id) {
            let from = scheduler
                .member(edge.from())
                .map(|m| m.key.as_str())
                .unwrap_or("?");
            match edge.condition() {
                Some(condition) => println!(
                    "      after {from} ({}) when {}",
                    edge.kind(),
                    serde_json::to_string(condition)?
                ),
                None => println!("      after {from} ({})", edge.kind()),
            }
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}
