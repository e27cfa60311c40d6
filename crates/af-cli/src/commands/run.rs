use std::path::Path;
use std::sync::Arc;

use af_core::config::Config;
use af_pilot::coordinator::PhaseCoordinator;
use af_pilot::events::PipelineEvent;
use af_pilot::executor::CommandExecutor;
use anyhow::Context;

/// Run the `run` subcommand: drive the iteration loop against a project.
pub async fn run(
    project: &Path,
    max_iterations: u64,
    json_logs: bool,
    verbose: u8,
) -> anyhow::Result<()> {
    let project = project
        .canonicalize()
        .with_context(|| format!("project directory {} not found", project.display()))?;

    let mut config = Config::load_for(&project).context("failed to load configuration")?;
    if max_iterations > 0 {
        config.pipeline.max_iterations = max_iterations;
    }

    let level = match verbose {
        0 => config.general.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    if json_logs {
        af_telemetry::init_logging_json("af", &level);
    } else {
        af_telemetry::init_logging("af", &level);
    }

    let executor = Arc::new(CommandExecutor::new(&config.executors));
    let (events_tx, events_rx) = flume::unbounded();
    let coordinator =
        PhaseCoordinator::new(config, project.clone(), executor).with_events(events_tx);

    // Ctrl-c requests a stop; the loop honors it between iterations.
    let stop = coordinator.stop_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.trigger();
        }
    });

    let printer = tokio::spawn(async move {
        while let Ok(event) = events_rx.recv_async().await {
            print_event(&event);
        }
    });

    // A corrupt state file surfaces here and exits non-zero; progress is
    // never silently discarded.
    let summary = coordinator
        .run()
        .await
        .context("pipeline stopped on an unrecoverable error")?;

    drop(coordinator);
    let _ = printer.await;

    println!();
    println!("pipeline finished: {}", summary.stop);
    println!("{}", "-".repeat(40));
    println!("Iterations (this run):  {}", summary.iterations);
    println!("Iterations (lifetime):  {}", summary.total_iterations);
    println!("Tasks completed:        {}", summary.tasks_completed);
    println!("Tasks failed:           {}", summary.tasks_failed);
    println!("Objectives completed:   {}", summary.objectives_completed);

    Ok(())
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::IterationStarted { iteration } => {
            println!("-- iteration {}", iteration + 1);
        }
        PipelineEvent::PhaseSelected {
            phase,
            task_id,
            reason,
            forced,
        } => {
            let marker = if *forced { " [forced]" } else { "" };
            match task_id {
                Some(task) => println!("   {phase}{marker}: task {task} ({reason})"),
                None => println!("   {phase}{marker}: {reason}"),
            }
        }
        PipelineEvent::OutcomeRecorded {
            phase,
            success,
            artifacts_changed,
        } => {
            let verdict = match (success, artifacts_changed) {
                (true, true) => "ok, artifacts changed",
                (true, false) => "ok",
                (false, _) => "failed",
            };
            println!("   {phase} -> {verdict}");
        }
        PipelineEvent::EscalationTriggered { recovery, reason } => {
            println!("   !! stagnation: {reason} -> forcing {recovery}");
        }
        PipelineEvent::TaskCompleted { title, .. } => {
            println!("   ++ task completed: {title}");
        }
        PipelineEvent::TaskPermanentlyFailed {
            title,
            failure_count,
            ..
        } => {
            println!("   xx task permanently failed after {failure_count} attempts: {title}");
        }
        PipelineEvent::ObjectiveCompleted { title, .. } => {
            println!("   ** objective completed: {title}");
        }
        PipelineEvent::Finished { .. } => {}
    }
}
