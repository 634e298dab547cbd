//! Command execution seam.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

/// Result of running one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status; `None` when killed by a signal or never started
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Set when the shell itself could not be started
    pub spawn_error: Option<String>,
}

impl CommandOutput {
    /// Exit status zero.
    pub fn success(&self) -> bool {
        self.spawn_error.is_none() && self.exit_code == Some(0)
    }

    pub(crate) fn spawn_failed(err: impl ToString) -> Self {
        Self {
            spawn_error: Some(err.to_string()),
            ..Self::default()
        }
    }
}

/// Runs a job's command. A failing command is a normal [`CommandOutput`],
/// never an error.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &str) -> CommandOutput;
}

/// Runs commands through the platform shell (`sh -c`, `cmd /C` on Windows).
///
/// The child is not tied to the future: dropping an unfinished `run` leaves
/// the command running to completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    fn command(command: &str) -> Command {
        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, command: &str) -> CommandOutput {
        match Self::command(command).output().await {
            Ok(output) => CommandOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                spawn_error: None,
            },
            Err(e) => CommandOutput::spawn_failed(e),
        }
    }
}
