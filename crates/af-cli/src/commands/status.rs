use std::path::Path;

use af_core::config::Config;
use af_core::state_store::StateStore;
use af_core::types::TaskStatus;
use anyhow::Context;

/// Run the `status` subcommand: pretty-print the persisted pipeline state.
pub fn run(project: &Path) -> anyhow::Result<()> {
    let project = project
        .canonicalize()
        .with_context(|| format!("project directory {} not found", project.display()))?;
    let config = Config::load_for(&project).context("failed to load configuration")?;
    let store = StateStore::for_project(&project, &config.pipeline.state_path);

    if !store.exists() {
        println!("no pipeline state found under {}", project.display());
        return Ok(());
    }

    let state = store.load().context("failed to load pipeline state")?;

    let count = |status: TaskStatus| state.tasks.values().filter(|t| t.status == status).count();

    println!("auto-forge status  ({})", state.run_id);
    println!("{}", "-".repeat(48));
    println!("Updated:           {}", state.updated.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Iterations:        {}", state.iteration);
    println!("Total tasks:       {}", state.tasks.len());
    println!("  new:             {}", count(TaskStatus::New));
    println!("  in_progress:     {}", count(TaskStatus::InProgress));
    println!("  awaiting_review: {}", count(TaskStatus::AwaitingReview));
    println!("  review_failed:   {}", count(TaskStatus::ReviewFailed));
    println!("  completed:       {}", count(TaskStatus::Completed));
    println!("  failed:          {}", count(TaskStatus::Failed));
    println!("  skipped:         {}", count(TaskStatus::Skipped));

    if !state.objectives.is_empty() {
        println!();
        println!("Objectives:");
        for objective in state.objectives.values() {
            println!(
                "  [{}] {:<40} {:>3.0}%  ({})",
                objective.level,
                objective.title,
                objective.completion_ratio * 100.0,
                objective.status
            );
        }
    }

    if !state.phase_stats.is_empty() {
        println!();
        println!("Phases:");
        for (phase, stats) in &state.phase_stats {
            println!(
                "  {:<14} runs={:<4} successes={:<4} no_progress_streak={}",
                phase.to_string(),
                stats.runs,
                stats.successes,
                stats.consecutive_no_progress
            );
        }
    }

    Ok(())
}
