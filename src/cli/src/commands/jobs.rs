//! Queue inspection: `status` and `list`.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use queuectl_core::jobs::{JobStatus, QueueStats, Supervisor, WorkerProcess};

use super::{job_rows, Context};
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct ListArgs {
    /// Only show jobs in this state (ready, running)
    #[arg(short, long)]
    state: Option<JobStatus>,
}

#[derive(Serialize)]
struct StatusReport {
    #[serde(flatten)]
    stats: QueueStats,
    workers: Vec<WorkerProcess>,
}

pub async fn status(ctx: &Context, format: OutputFormat) -> Result<()> {
    let stats = ctx.queue.status().await?;
    let workers = Supervisor::new(ctx.store.clone()).registered().await?;

    match format {
        OutputFormat::Table => {
            output::print_header("Queue");
            output::print_detail("Active", &stats.active.to_string());
            output::print_detail("  ready", &stats.ready.to_string());
            output::print_detail("  running", &stats.running.to_string());
            output::print_detail("Dead letter", &stats.dead_letter.to_string());
            output::print_detail(
                "Workers",
                &format!("{} registered, {} alive", stats.workers_registered, stats.workers_alive),
            );
            for worker in &workers {
                let state = if worker.alive { "alive" } else { "gone" };
                output::print_detail(&format!("  pid {}", worker.pid), state);
            }
            output::print_detail("Data dir", &ctx.store.root().display().to_string());
        }
        _ => output::print_item(&StatusReport { stats, workers }, format)?,
    }

    Ok(())
}

pub async fn list(args: ListArgs, ctx: &Context, format: OutputFormat) -> Result<()> {
    let jobs = ctx.queue.list(args.state).await?;

    match format {
        OutputFormat::Table => output::print_table(&job_rows(&jobs), "No jobs found."),
        _ => output::print_item(&jobs, format)?,
    }

    Ok(())
}
