//! Worker process commands.

use anyhow::{Context as _, Result};
use clap::Subcommand;

use queuectl_core::jobs::{JobWorker, Supervisor, WORKER_LOG_FILE};

use super::Context;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum WorkerCommands {
    /// Start detached worker processes
    Start {
        /// Number of workers to start
        #[arg(short, long, default_value = "1")]
        count: usize,
    },

    /// Run a worker in the foreground until SIGINT/SIGTERM
    Run {
        /// Maximum concurrent jobs (overrides worker.concurrency)
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Name used in this worker's log lines
        #[arg(long)]
        id: Option<String>,
    },

    /// Stop all registered workers
    Stop,
}

pub async fn execute(cmd: WorkerCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    let supervisor = Supervisor::new(ctx.store.clone());

    match cmd {
        WorkerCommands::Start { count } => {
            let pids = supervisor
                .start_many(count)
                .await
                .context("Failed to start workers")?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Started {} worker(s)", pids.len()));
                    for pid in &pids {
                        output::print_detail("pid", &pid.to_string());
                    }
                    output::print_detail(
                        "Log",
                        &ctx.store.root().join(WORKER_LOG_FILE).display().to_string(),
                    );
                }
                _ => output::print_item(&serde_json::json!({ "started": pids }), format)?,
            }
        }

        WorkerCommands::Run { concurrency, id } => {
            let mut worker = JobWorker::from_config(ctx.store.clone(), &ctx.config);
            if let Some(concurrency) = concurrency {
                worker = worker.with_concurrency(concurrency);
            }
            if let Some(id) = id {
                worker = worker.with_name(id);
            }

            let stats = supervisor.run(worker).await?;
            tracing::info!(
                processed = stats.processed(),
                succeeded = stats.succeeded(),
                failed = stats.failed(),
                dead_lettered = stats.dead_lettered(),
                "Worker exited"
            );
        }

        WorkerCommands::Stop => {
            let report = supervisor.stop_all().await?;
            match format {
                OutputFormat::Table => {
                    if report.signalled.is_empty() && report.already_dead.is_empty() {
                        output::print_info("No workers registered.");
                    } else {
                        output::print_success(&format!(
                            "Stopped {} worker(s)",
                            report.signalled.len()
                        ));
                        if !report.already_dead.is_empty() {
                            output::print_detail(
                                "Already gone",
                                &report
                                    .already_dead
                                    .iter()
                                    .map(u32::to_string)
                                    .collect::<Vec<_>>()
                                    .join(", "),
                            );
                        }
                    }
                }
                _ => output::print_item(&report, format)?,
            }
        }
    }

    Ok(())
}
