//! Queue Manager: submission, inspection, dead-letter handling and job defaults.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::job::{Job, JobDefaults, JobId, JobStatus};
use crate::error::{QueueError, Result};
use crate::process;
use crate::store::{Collection, Store};

// ═══════════════════════════════════════════════════════════════════════════════
// Submission
// ═══════════════════════════════════════════════════════════════════════════════

/// A validated submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    command: String,
}

impl SubmitRequest {
    /// Submission of a plain command.
    pub fn new(command: impl Into<String>) -> Result<Self> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(QueueError::invalid_payload("command must not be empty"));
        }
        Ok(Self { command })
    }

    /// Parse operator input.
    ///
    /// `{...}` must be a JSON object with a non-empty string `command`;
    /// `"..."` must be a JSON string. Anything else is the command itself.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        match trimmed.chars().next() {
            None => Err(QueueError::invalid_payload("command must not be empty")),
            Some('{') => {
                let value: serde_json::Value = serde_json::from_str(trimmed).map_err(|e| {
                    QueueError::invalid_payload("payload is not valid JSON").with_source(e)
                })?;
                match value.get("command") {
                    Some(serde_json::Value::String(command)) => Self::new(command.as_str()),
                    Some(_) => Err(QueueError::invalid_payload("'command' must be a string")),
                    None => Err(QueueError::invalid_payload("payload has no 'command' field")),
                }
            }
            Some('"') => {
                let command: String = serde_json::from_str(trimmed).map_err(|e| {
                    QueueError::invalid_payload("payload is not a valid JSON string").with_source(e)
                })?;
                Self::new(command)
            }
            Some(_) => Self::new(trimmed),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs in the active collection
    pub active: usize,
    /// Active jobs waiting to be claimed
    pub ready: usize,
    /// Active jobs claimed by a worker
    pub running: usize,
    /// Jobs in the dead-letter queue
    pub dead_letter: usize,
    /// Worker pids in the registry
    pub workers_registered: usize,
    /// Registered pids that are still alive
    pub workers_alive: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// Operator-facing view of the store.
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Store,
}

impl JobQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Store a new ready job built from the current defaults.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Job> {
        let defaults = self.defaults().await?;
        let job = Job::new(request.command, &defaults, Utc::now());

        let stored = job.clone();
        self.store
            .update(Collection::Jobs, move |jobs: &mut Vec<Job>| jobs.push(stored))
            .await?;

        metrics::counter!("queuectl_jobs_submitted_total").increment(1);
        info!(job_id = %job.id, command = %job.command, "Job submitted");
        Ok(job)
    }

    /// Active jobs in insertion order, optionally filtered by status.
    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let jobs: Vec<Job> = self.store.read(Collection::Jobs).await?;
        Ok(match status {
            Some(status) => jobs.into_iter().filter(|j| j.status == status).collect(),
            None => jobs,
        })
    }

    /// Counts across collections and the worker registry.
    pub async fn status(&self) -> Result<QueueStats> {
        let jobs: Vec<Job> = self.store.read(Collection::Jobs).await?;
        let dlq: Vec<Job> = self.store.read(Collection::DeadLetter).await?;
        let pids: Vec<u32> = self.store.read(Collection::Workers).await?;

        let count = |status: JobStatus| jobs.iter().filter(|j| j.status == status).count();
        Ok(QueueStats {
            active: jobs.len(),
            ready: count(JobStatus::Ready),
            running: count(JobStatus::Running),
            dead_letter: dlq.len(),
            workers_registered: pids.len(),
            workers_alive: pids.iter().filter(|pid| process::is_alive(**pid)).count(),
        })
    }

    pub async fn dlq_list(&self) -> Result<Vec<Job>> {
        self.store.read(Collection::DeadLetter).await
    }

    /// Move a dead-lettered job back into the active collection.
    ///
    /// The copy lands in `jobs` before the DLQ entry is removed, so a crash
    /// in between leaves the job in both places rather than in neither.
    pub async fn dlq_replay(&self, id: &JobId) -> Result<Job> {
        let dlq: Vec<Job> = self.store.read(Collection::DeadLetter).await?;
        let parked = dlq
            .iter()
            .find(|j| j.id == *id)
            .ok_or_else(|| QueueError::not_found("Job", id))?;
        let replayed = parked.reset_for_replay(Utc::now());

        let active = replayed.clone();
        self.store
            .update(Collection::Jobs, move |jobs: &mut Vec<Job>| {
                if jobs.iter().all(|j| j.id != active.id) {
                    jobs.push(active);
                }
            })
            .await?;

        let id = *id;
        self.store
            .update(Collection::DeadLetter, move |dlq: &mut Vec<Job>| {
                dlq.retain(|j| j.id != id)
            })
            .await?;

        metrics::counter!("queuectl_jobs_replayed_total").increment(1);
        info!(job_id = %replayed.id, "Job replayed from DLQ");
        Ok(replayed)
    }

    /// Empty the DLQ, returning how many jobs were dropped.
    pub async fn dlq_clear(&self) -> Result<usize> {
        let removed = self
            .store
            .update(Collection::DeadLetter, |dlq: &mut Vec<Job>| {
                let n = dlq.len();
                dlq.clear();
                n
            })
            .await?;
        info!(removed, "DLQ cleared");
        Ok(removed)
    }

    pub async fn defaults(&self) -> Result<JobDefaults> {
        self.store.read(Collection::Config).await
    }

    /// Change one job default. Jobs already submitted keep their snapshot.
    pub async fn set_default(&self, key: &str, value: &str) -> Result<JobDefaults> {
        let updated = self
            .store
            .update(Collection::Config, |defaults: &mut JobDefaults| {
                let mut candidate = *defaults;
                candidate.set(key, value)?;
                *defaults = candidate;
                Ok::<_, QueueError>(candidate)
            })
            .await??;
        debug!(key, value, "Job default updated");
        Ok(updated)
    }
}
