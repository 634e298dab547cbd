//! Process Supervisor: detached worker processes and the pid registry.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{info, warn};

use super::worker::{JobWorker, WorkerStats};
use crate::config::DATA_DIR_ENV;
use crate::error::{ErrorCode, QueueError, Result};
use crate::process;
use crate::store::{Collection, Store};

/// File (inside the data directory) receiving detached workers' output.
pub const WORKER_LOG_FILE: &str = "worker.log";

/// A registered worker pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProcess {
    pub pid: u32,
    pub alive: bool,
}

/// Result of [`Supervisor::stop_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    /// Pids that received `SIGTERM`
    pub signalled: Vec<u32>,
    /// Pids that were already gone
    pub already_dead: Vec<u32>,
}

/// Starts, tracks and stops worker processes.
#[derive(Debug, Clone)]
pub struct Supervisor {
    store: Store,
    program: Option<PathBuf>,
    args: Vec<OsString>,
}

impl Supervisor {
    /// Supervisor that launches `<current executable> worker run`.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            program: None,
            args: vec!["worker".into(), "run".into()],
        }
    }

    /// Launch `program args...` instead of re-invoking the current executable.
    pub fn with_command<I, S>(mut self, program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.program = Some(program.into());
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Spawn one detached worker and record its pid.
    pub async fn start_detached(&self) -> Result<u32> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|e| {
                QueueError::new(ErrorCode::ProcessSpawnFailed, "cannot locate current executable")
                    .with_source(e)
            })?,
        };

        let log_path = self.store.root().join(WORKER_LOG_FILE);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| QueueError::io(ErrorCode::ProcessSpawnFailed, &log_path, e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| QueueError::io(ErrorCode::ProcessSpawnFailed, &log_path, e))?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.args)
            .env(DATA_DIR_ENV, self.store.root())
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|e| {
            QueueError::new(
                ErrorCode::ProcessSpawnFailed,
                format!("failed to start {}", program.display()),
            )
            .with_source(e)
        })?;
        let pid = child.id();

        self.store
            .update(Collection::Workers, move |pids: &mut Vec<u32>| {
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            })
            .await?;

        info!(pid, log = %log_path.display(), "Started detached worker");
        Ok(pid)
    }

    /// Spawn `count` detached workers.
    pub async fn start_many(&self, count: usize) -> Result<Vec<u32>> {
        let mut pids = Vec::with_capacity(count);
        for _ in 0..count {
            pids.push(self.start_detached().await?);
        }
        Ok(pids)
    }

    /// Signal every registered worker and clear the registry.
    pub async fn stop_all(&self) -> Result<StopReport> {
        let pids = self
            .store
            .update(Collection::Workers, |pids: &mut Vec<u32>| std::mem::take(pids))
            .await?;

        let mut report = StopReport::default();
        for pid in pids {
            match process::terminate(pid) {
                Ok(true) => report.signalled.push(pid),
                Ok(false) => report.already_dead.push(pid),
                Err(e) => {
                    warn!(pid, error = %e, "Could not signal worker");
                    report.already_dead.push(pid);
                }
            }
        }

        info!(
            signalled = report.signalled.len(),
            already_dead = report.already_dead.len(),
            "Stopped workers"
        );
        Ok(report)
    }

    /// Registered pids with their liveness.
    pub async fn registered(&self) -> Result<Vec<WorkerProcess>> {
        let pids: Vec<u32> = self.store.read(Collection::Workers).await?;
        Ok(pids
            .into_iter()
            .map(|pid| WorkerProcess {
                pid,
                alive: process::is_alive(pid),
            })
            .collect())
    }

    /// Run `worker` in this process until `SIGINT`/`SIGTERM`, then drain it
    /// and drop this process from the registry.
    pub async fn run(&self, worker: JobWorker) -> Result<WorkerStats> {
        let signal = shutdown_signal()?;
        let handle = worker.start();

        signal.await;
        info!("Shutdown signal received");

        let stats = handle.stop().await;
        self.deregister(process::current_pid()).await?;
        Ok(stats)
    }

    async fn deregister(&self, pid: u32) -> Result<()> {
        self.store
            .update(Collection::Workers, move |pids: &mut Vec<u32>| pids.retain(|p| *p != pid))
            .await
    }
}

/// Install the handlers up front so a signal that arrives while the worker
/// starts is not lost.
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| {
            QueueError::new(ErrorCode::SignalFailed, "failed to install SIGTERM handler")
                .with_source(e)
        })?;

    Ok(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Ctrl+C handler failed");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            terminate.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    })
}
