//! queuectl - command-line interface for the file-persisted job queue.
//!
//! Provides commands for submitting jobs, running and stopping workers,
//! inspecting the queue and the dead-letter queue, and editing job defaults.

mod commands;
mod output;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use commands::{config, dlq, enqueue, jobs, worker, Context};
use output::OutputFormat;
use queuectl_core::config::DATA_DIR_ENV;
use queuectl_core::telemetry::init_logging;

/// queuectl - a single-machine job queue backed by JSON files
#[derive(Parser)]
#[command(
    name = "queuectl",
    version,
    about = "queuectl - a single-machine job queue backed by JSON files",
    long_about = "Submit shell commands, run workers that execute them with retries and \
                  exponential backoff, and inspect or replay the dead-letter queue.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Directory holding the queue's data files
    #[arg(long, global = true, env = DATA_DIR_ENV)]
    data_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Log engine activity to stderr (repeat for debug output)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job: a raw shell command or {"command": "..."}
    Enqueue(enqueue::EnqueueArgs),

    /// Worker process management
    #[command(subcommand)]
    Worker(worker::WorkerCommands),

    /// Show queue counts and registered workers
    Status,

    /// List active jobs
    List(jobs::ListArgs),

    /// Dead-letter queue operations
    #[command(subcommand)]
    Dlq(dlq::DlqCommands),

    /// Job defaults (maxRetries, backoffBase)
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

impl Commands {
    fn is_foreground_worker(&self) -> bool {
        matches!(self, Commands::Worker(worker::WorkerCommands::Run { .. }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let ctx = Context::open(cli.data_dir).await?;

    let mut logging = ctx.config.logging.clone();
    if !cli.command.is_foreground_worker() && std::env::var_os("RUST_LOG").is_none() {
        logging.level = match cli.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
        .to_string();
    }
    init_logging(&logging)?;

    let format = cli.output;
    match cli.command {
        Commands::Enqueue(args) => enqueue::execute(args, &ctx, format).await,
        Commands::Worker(cmd) => worker::execute(cmd, &ctx, format).await,
        Commands::Status => jobs::status(&ctx, format).await,
        Commands::List(args) => jobs::list(args, &ctx, format).await,
        Commands::Dlq(cmd) => dlq::execute(cmd, &ctx, format).await,
        Commands::Config(cmd) => config::execute(cmd, &ctx, format).await,
    }
}
