//! Subcommand implementations.

pub mod config;
pub mod dlq;
pub mod enqueue;
pub mod jobs;
pub mod worker;

use anyhow::{Context as _, Result};
use std::path::PathBuf;
use tabled::Tabled;

use queuectl_core::config::{default_data_dir, QueueConfig};
use queuectl_core::jobs::{Job, JobQueue};
use queuectl_core::store::Store;

use crate::output::format_time;

/// Everything a command needs: settings, the opened store and the queue.
pub struct Context {
    pub config: QueueConfig,
    pub store: Store,
    pub queue: JobQueue,
}

impl Context {
    /// Load settings for `data_dir` (or the default directory) and open the
    /// store, creating its files on first use.
    pub async fn open(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let config = QueueConfig::load_from(&data_dir)
            .with_context(|| format!("Failed to load configuration for {}", data_dir.display()))?;
        let store = Store::open(&config)
            .await
            .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;
        let queue = JobQueue::new(store.clone());
        Ok(Self { config, store, queue })
    }
}

/// Table row for a job.
#[derive(Tabled)]
pub struct JobRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Command")]
    command: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Retries")]
    retries: String,
    #[tabled(rename = "Next Attempt")]
    next_attempt: String,
    #[tabled(rename = "Created")]
    created_at: String,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            command: job.command.clone(),
            state: job.status.to_string(),
            retries: format!("{}/{}", job.retries, job.max_retries),
            next_attempt: format_time(job.next_attempt),
            created_at: format_time(job.created_at),
        }
    }
}

pub fn job_rows(jobs: &[Job]) -> Vec<JobRow> {
    jobs.iter().map(JobRow::from).collect()
}
