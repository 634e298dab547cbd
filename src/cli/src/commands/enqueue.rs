//! Job submission.

use anyhow::Result;
use clap::Args;

use queuectl_core::jobs::SubmitRequest;

use super::Context;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct EnqueueArgs {
    /// Shell command, or a JSON object such as '{"command": "sleep 2"}'.
    /// Quote it as one argument: `queuectl enqueue 'sh -c "exit 1"'`
    #[arg(allow_hyphen_values = true)]
    payload: String,
}

pub async fn execute(args: EnqueueArgs, ctx: &Context, format: OutputFormat) -> Result<()> {
    let request = SubmitRequest::parse(&args.payload)?;
    let job = ctx.queue.submit(request).await?;

    match format {
        OutputFormat::Table => {
            output::print_success(&format!("Enqueued job {}", job.id));
            output::print_detail("Command", &job.command);
            output::print_detail("Max retries", &job.max_retries.to_string());
        }
        _ => output::print_item(&job, format)?,
    }

    Ok(())
}
