//! Worker loop: claims due jobs, runs them, and records the outcome.
//!
//! A claim is the job's lock marker plus `status = running` written while
//! the marker is held. The marker is released on every path once the outcome
//! has been persisted.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::executor::{CommandExecutor, CommandOutput, ShellExecutor};
use super::job::{FailureOutcome, Job, JobId, JobStatus};
use crate::config::{QueueConfig, WorkerSettings};
use crate::error::Result;
use crate::lock::{LockGuard, LockManager};
use crate::store::{Collection, Store};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent job executions
    pub concurrency: usize,
    /// Idle wait when nothing is claimable
    pub poll_interval: Duration,
    /// Limit on how long shutdown waits for in-flight jobs; `None` waits
    /// for them to finish
    pub shutdown_timeout: Option<Duration>,
    /// Worker name/identifier
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&WorkerSettings::default())
    }
}

impl From<&WorkerSettings> for WorkerConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            concurrency: settings.concurrency.max(1),
            poll_interval: settings.poll_interval,
            shutdown_timeout: settings.shutdown_timeout,
            name: format!("worker-{}", crate::process::current_pid()),
        }
    }
}

/// Statistics for the job worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total jobs executed
    pub processed: Arc<AtomicU64>,
    /// Jobs whose command exited with status zero
    pub succeeded: Arc<AtomicU64>,
    /// Failed attempts, including the final one of dead-lettered jobs
    pub failed: Arc<AtomicU64>,
    /// Jobs moved to the dead-letter queue
    pub dead_lettered: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// A job this worker holds the claim for.
#[derive(Debug)]
pub struct ClaimedJob {
    /// The record as it was when claimed (`status == running`)
    pub job: Job,
    /// Whether the job was found `running` without a live claim
    pub recovered: bool,
    guard: LockGuard,
}

/// What happened to a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Removed from the active collection
    Succeeded,
    /// Back to `ready`, deferred until `next_attempt`
    Retrying { next_attempt: DateTime<Utc> },
    /// Moved to the dead-letter queue
    DeadLettered,
    /// The record disappeared while the command ran
    Vanished,
}

/// One finished claim+execute cycle.
#[derive(Debug, Clone)]
pub struct ProcessedJob {
    pub job_id: JobId,
    pub outcome: JobOutcome,
    pub output: CommandOutput,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to stop claiming and drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Signal shutdown and wait for the loop to drain.
    pub async fn stop(self) -> WorkerStats {
        self.shutdown();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Worker task ended abnormally");
        }
        self.stats
    }
}

/// Job worker that processes jobs from the store.
#[derive(Clone)]
pub struct JobWorker {
    store: Store,
    locks: LockManager,
    executor: Arc<dyn CommandExecutor>,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl JobWorker {
    /// Create a worker over `store`, claiming through `locks`.
    pub fn new(store: Store, locks: LockManager, config: WorkerConfig) -> Self {
        Self {
            store,
            locks,
            executor: Arc::new(ShellExecutor),
            config,
            stats: WorkerStats::new(),
        }
    }

    /// Worker wired from the engine configuration. Job claims are only
    /// reclaimed from workers that have exited.
    pub fn from_config(store: Store, config: &QueueConfig) -> Self {
        let locks = LockManager::owner_bound(store.lock_dir());
        Self::new(store, locks, WorkerConfig::from(&config.worker))
    }

    /// Replace the command executor.
    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Override the number of jobs run at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency.max(1);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Claiming
    // ─────────────────────────────────────────────────────────────────────────

    /// Claim the first eligible job, if any.
    ///
    /// Due `ready` jobs come first in insertion order, then `running` jobs
    /// whose claim is gone. A candidate is only taken when its marker can be
    /// acquired and the fresh record is still eligible.
    pub async fn claim_next(&self) -> Result<Option<ClaimedJob>> {
        let now = Utc::now();
        let jobs: Vec<Job> = self.store.read(Collection::Jobs).await?;

        let candidates: Vec<JobId> = jobs
            .iter()
            .filter(|j| j.is_due(now))
            .chain(jobs.iter().filter(|j| j.status == JobStatus::Running))
            .map(|j| j.id)
            .collect();

        for id in candidates {
            let Some(guard) = self.locks.try_acquire(&id.lock_name()).await? else {
                continue;
            };

            let claimed = self
                .store
                .update(Collection::Jobs, |jobs: &mut Vec<Job>| {
                    let job = jobs.iter_mut().find(|j| j.id == id)?;
                    let recovered = match job.status {
                        JobStatus::Ready if job.next_attempt <= now => false,
                        JobStatus::Running => true,
                        _ => return None,
                    };
                    job.status = JobStatus::Running;
                    Some((job.clone(), recovered))
                })
                .await;

            match claimed {
                Ok(Some((job, recovered))) => {
                    if recovered {
                        metrics::counter!("queuectl_jobs_recovered_total").increment(1);
                        warn!(job_id = %job.id, retries = job.retries, "Recovered orphaned running job");
                    }
                    debug!(worker = %self.config.name, job_id = %job.id, "Claimed job");
                    return Ok(Some(ClaimedJob { job, recovered, guard }));
                }
                Ok(None) => self.release(guard).await,
                Err(e) => {
                    self.release(guard).await;
                    return Err(e);
                }
            }
        }

        Ok(None)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a claimed job and persist its outcome. The claim is released
    /// whatever happens.
    ///
    /// A recovered job that had already exhausted its retries was left
    /// behind by an interrupted dead-lettering; it is parked again without
    /// running its command.
    pub async fn execute(&self, claimed: ClaimedJob) -> Result<ProcessedJob> {
        let ClaimedJob { job, recovered, guard } = claimed;

        if recovered && job.retries > job.max_retries {
            warn!(job_id = %job.id, retries = job.retries, "Completing interrupted dead-lettering");
            let result = self.dead_letter(job.clone()).await;
            self.release(guard).await;
            result?;
            return Ok(ProcessedJob {
                job_id: job.id,
                outcome: JobOutcome::DeadLettered,
                output: CommandOutput::default(),
            });
        }

        self.stats.active.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("queuectl_jobs_active").increment(1.0);
        info!(job_id = %job.id, command = %job.command, attempt = job.retries + 1, "Executing job");

        let output = self.executor.run(&job.command).await;

        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("queuectl_jobs_active").decrement(1.0);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        let result = self.finish(&job, &output).await;
        self.release(guard).await;

        let outcome = result?;
        Ok(ProcessedJob {
            job_id: job.id,
            outcome,
            output,
        })
    }

    /// Claim and run one job inline.
    pub async fn run_once(&self) -> Result<Option<ProcessedJob>> {
        match self.claim_next().await? {
            Some(claimed) => self.execute(claimed).await.map(Some),
            None => Ok(None),
        }
    }

    async fn finish(&self, job: &Job, output: &CommandOutput) -> Result<JobOutcome> {
        if output.success() {
            let id = job.id;
            self.store
                .update(Collection::Jobs, move |jobs: &mut Vec<Job>| jobs.retain(|j| j.id != id))
                .await?;

            self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("queuectl_jobs_succeeded_total").increment(1);
            info!(job_id = %job.id, stdout = %output.stdout.trim_end(), "Job succeeded");
            return Ok(JobOutcome::Succeeded);
        }

        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("queuectl_jobs_failed_total").increment(1);
        warn!(
            job_id = %job.id,
            exit_code = ?output.exit_code,
            spawn_error = ?output.spawn_error,
            stderr = %output.stderr.trim_end(),
            "Job failed"
        );

        let now = Utc::now();
        let id = job.id;
        let recorded = self
            .store
            .update(Collection::Jobs, move |jobs: &mut Vec<Job>| {
                let record = jobs.iter_mut().find(|j| j.id == id)?;
                let outcome = record.record_failure(now);
                Some((outcome, record.clone()))
            })
            .await?;

        match recorded {
            None => {
                warn!(job_id = %job.id, "Job record vanished during execution");
                Ok(JobOutcome::Vanished)
            }
            Some((FailureOutcome::Retry { next_attempt }, record)) => {
                info!(
                    job_id = %record.id,
                    retries = record.retries,
                    next_attempt = %next_attempt,
                    "Job scheduled for retry"
                );
                Ok(JobOutcome::Retrying { next_attempt })
            }
            Some((FailureOutcome::Exhausted, record)) => {
                self.dead_letter(record).await?;
                Ok(JobOutcome::DeadLettered)
            }
        }
    }

    /// Park an exhausted job: append to the DLQ, then drop it from `jobs`.
    async fn dead_letter(&self, mut record: Job) -> Result<()> {
        let id = record.id;
        let retries = record.retries;
        record.status = JobStatus::InDlq;

        self.store
            .update(Collection::DeadLetter, move |dlq: &mut Vec<Job>| {
                if dlq.iter().all(|j| j.id != record.id) {
                    dlq.push(record);
                }
            })
            .await?;
        self.store
            .update(Collection::Jobs, move |jobs: &mut Vec<Job>| jobs.retain(|j| j.id != id))
            .await?;

        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("queuectl_jobs_dead_lettered_total").increment(1);
        warn!(job_id = %id, retries, "Job moved to dead-letter queue");
        Ok(())
    }

    async fn release(&self, guard: LockGuard) {
        let name = guard.name().to_string();
        if let Err(e) = self.locks.release(guard).await {
            warn!(lock = %name, error = %e, "Failed to release job claim");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loop
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the loop on the runtime, returning a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let span = info_span!("worker", name = %self.config.name);
        let task = tokio::spawn(self.run_loop(shutdown_rx).instrument(span));

        WorkerHandle {
            shutdown: shutdown_tx,
            stats,
            task,
        }
    }

    /// Claim and dispatch jobs until `shutdown` turns true, then wait for
    /// in-flight jobs (bounded by `shutdown_timeout` when one is set).
    pub async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        let concurrency = self.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        info!(concurrency, poll_interval = ?self.config.poll_interval, "Job worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match self.claim_next().await {
                Ok(Some(claimed)) => {
                    let worker = self.clone();
                    let span = info_span!("job", job_id = %claimed.job.id);
                    tokio::spawn(
                        async move {
                            let _permit = permit;
                            if let Err(e) = worker.execute(claimed).await {
                                e.log();
                            }
                        }
                        .instrument(span),
                    );
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    e.log();
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(active = self.stats.active(), "Worker shutting down");

        let all = u32::try_from(concurrency).unwrap_or(u32::MAX);
        let drained = match self.config.shutdown_timeout {
            Some(limit) => tokio::time::timeout(limit, semaphore.acquire_many(all))
                .await
                .is_ok(),
            None => {
                let _ = semaphore.acquire_many(all).await;
                true
            }
        };

        if drained {
            info!(processed = self.stats.processed(), "Worker stopped");
        } else {
            warn!(
                active = self.stats.active(),
                timeout = ?self.config.shutdown_timeout,
                "Worker stopped with jobs still in flight"
            );
        }
    }
}
