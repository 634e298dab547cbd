//! Job lifecycle engine.
//!
//! - **Job**: persisted record, status transitions, retry/backoff arithmetic
//! - **Queue**: submission, listing, dead-letter handling, job defaults
//! - **Executor**: runs a job's shell command
//! - **Worker**: claims due jobs through lock markers and records outcomes
//! - **Supervisor**: detached worker processes and their pid registry
//!
//! # Lifecycle
//!
//! ```text
//!   submit ──▶ ready ──claim──▶ running ──exit 0──▶ (removed)
//!                ▲                 │
//!                │   retries <= max│ failure: retries += 1
//!                └──── backoff ────┤
//!                                  │ retries > max
//!                                  ▼
//!                               in_dlq ──replay──▶ ready (retries = 0)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use queuectl_core::jobs::{JobQueue, JobWorker, SubmitRequest};
//!
//! let queue = JobQueue::new(store.clone());
//! queue.submit(SubmitRequest::parse("echo hello")?).await?;
//!
//! let worker = JobWorker::from_config(store, &config);
//! worker.run_once().await?;
//! ```

pub mod executor;
pub mod job;
pub mod queue;
pub mod supervisor;
pub mod worker;

pub use executor::{CommandExecutor, CommandOutput, ShellExecutor};
pub use job::{FailureOutcome, Job, JobDefaults, JobId, JobStatus, BACKOFF_BASE_KEY, MAX_RETRIES_KEY};
pub use queue::{JobQueue, QueueStats, SubmitRequest};
pub use supervisor::{StopReport, Supervisor, WorkerProcess, WORKER_LOG_FILE};
pub use worker::{
    ClaimedJob, JobOutcome, JobWorker, ProcessedJob, WorkerConfig, WorkerHandle, WorkerStats,
};
