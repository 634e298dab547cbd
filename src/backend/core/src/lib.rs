#![allow(clippy::result_large_err)]
//! # queuectl core
//!
//! A single-machine job queue persisted in plain JSON files. Shell commands
//! are submitted, claimed by independent worker processes, retried with
//! exponential backoff and finally parked in a dead-letter queue.
//!
//! ## Architecture
//!
//! - **Store**: whole-document JSON collections with atomic replace and a
//!   cross-process mutex around read-modify-write
//! - **Lock**: exclusive-create marker files with stale-owner reclaim
//! - **Jobs**: queue manager, worker loop and process supervisor
//! - **Telemetry**: `tracing` subscriber setup
//!
//! ## Data directory
//!
//! ```text
//! jobs.json  dlq.json  config.json  pids.json  locks/  worker.log  [queuectl.toml]
//! ```

pub mod config;
pub mod error;
pub mod jobs;
pub mod lock;
pub mod process;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorSeverity, QueueError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::QueueConfig;
    pub use crate::error::{ErrorCode, QueueError, Result};
    pub use crate::jobs::{
        CommandExecutor, CommandOutput, Job, JobDefaults, JobId, JobOutcome, JobQueue,
        JobStatus, JobWorker, QueueStats, ShellExecutor, SubmitRequest, Supervisor,
        WorkerConfig, WorkerStats,
    };
    pub use crate::lock::{LockGuard, LockManager};
    pub use crate::store::{Collection, Store};
}
