//! Dead-letter queue commands.

use anyhow::Result;
use clap::Subcommand;

use queuectl_core::jobs::JobId;

use super::{job_rows, Context};
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum DlqCommands {
    /// List dead-lettered jobs
    List,

    /// Move a dead-lettered job back to the queue with its retries reset
    Retry {
        /// Job ID
        job_id: JobId,
    },

    /// Drop every dead-lettered job
    Clear,
}

pub async fn execute(cmd: DlqCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match cmd {
        DlqCommands::List => {
            let jobs = ctx.queue.dlq_list().await?;
            match format {
                OutputFormat::Table => output::print_table(&job_rows(&jobs), "DLQ is empty."),
                _ => output::print_item(&jobs, format)?,
            }
        }

        DlqCommands::Retry { job_id } => {
            let job = ctx.queue.dlq_replay(&job_id).await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Job {} moved back to the queue", job.id))
                }
                _ => output::print_item(&job, format)?,
            }
        }

        DlqCommands::Clear => {
            let removed = ctx.queue.dlq_clear().await?;
            match format {
                OutputFormat::Table => {
                    if removed == 0 {
                        output::print_info("DLQ is empty.");
                    } else {
                        output::print_success(&format!("Removed {} job(s) from the DLQ", removed));
                    }
                }
                _ => output::print_item(&serde_json::json!({ "removed": removed }), format)?,
            }
        }
    }

    Ok(())
}
