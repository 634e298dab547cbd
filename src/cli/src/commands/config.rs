//! Job defaults management.
//!
//! Values live in the `config.json` collection of the data directory and are
//! copied onto each job when it is submitted.

use anyhow::Result;
use clap::Subcommand;

use queuectl_core::jobs::JobDefaults;

use super::Context;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Set a job default
    Set {
        /// Key (maxRetries or backoffBase)
        key: String,
        /// Value to set
        value: String,
    },

    /// Get a job default
    Get {
        /// Key (maxRetries or backoffBase)
        key: String,
    },

    /// Show all job defaults
    Show,
}

pub async fn execute(cmd: ConfigCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Set { key, value } => {
            let defaults = ctx.queue.set_default(&key, &value).await?;
            let stored = defaults.get(&key)?;

            match format {
                OutputFormat::Table => output::print_success(&format!("{} = {}", key, stored)),
                _ => output::print_item(
                    &serde_json::json!({ "key": key, "value": stored }),
                    format,
                )?,
            }
        }

        ConfigCommands::Get { key } => {
            let value = ctx.queue.defaults().await?.get(&key)?;
            match format {
                OutputFormat::Table => println!("{}", value),
                _ => output::print_item(&serde_json::json!({ "key": key, "value": value }), format)?,
            }
        }

        ConfigCommands::Show => {
            let defaults = ctx.queue.defaults().await?;
            match format {
                OutputFormat::Table => {
                    output::print_header("Job defaults");
                    for key in JobDefaults::KEYS {
                        output::print_detail(key, &defaults.get(key)?.to_string());
                    }
                }
                _ => output::print_item(&defaults, format)?,
            }
        }
    }

    Ok(())
}
