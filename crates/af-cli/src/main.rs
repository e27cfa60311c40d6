mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// auto-forge CLI -- drive the autonomous development pipeline.
#[derive(Parser)]
#[command(name = "af", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline loop until all objectives complete (or a stop).
    Run {
        /// Target project directory.
        #[arg(default_value = ".")]
        project: PathBuf,

        /// Stop after N iterations (0 = run until a terminal condition).
        #[arg(long, default_value_t = 0)]
        max_iterations: u64,

        /// Emit JSON logs instead of human-readable output.
        #[arg(long)]
        json_logs: bool,

        /// Increase log verbosity (-v = debug, -vv = trace).
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
    },

    /// Print a summary of the persisted pipeline state.
    Status {
        /// Target project directory.
        #[arg(default_value = ".")]
        project: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            project,
            max_iterations,
            json_logs,
            verbose,
        } => commands::run::run(&project, max_iterations, json_logs, verbose).await,
        Commands::Status { project } => commands::status::run(&project),
    }
}
