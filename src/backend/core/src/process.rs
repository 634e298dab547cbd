//! Operating-system process helpers: liveness probes and termination signals.

use crate::error::{ErrorCode, QueueError, Result};

/// Id of the current process.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Check whether a process with `pid` currently exists.
///
/// On Unix this sends signal 0, which performs the permission and existence
/// checks without delivering anything. `EPERM` still means the process exists.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == current_pid() {
        return true;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) with signal 0 has no side effects.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a portable probe every non-zero pid is treated as alive, so
/// markers are only reclaimed by age.
#[cfg(not(unix))]
pub fn is_alive(pid: u32) -> bool {
    pid != 0
}

/// Ask the process `pid` to terminate (`SIGTERM`).
///
/// Returns `Ok(false)` when the process no longer exists.
#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<bool> {
    let raw = libc::pid_t::try_from(pid).map_err(|_| {
        QueueError::new(ErrorCode::SignalFailed, format!("pid out of range: {}", pid))
    })?;
    if raw <= 0 {
        return Err(QueueError::new(
            ErrorCode::SignalFailed,
            format!("refusing to signal pid {}", pid),
        ));
    }
    // SAFETY: plain kill(2) on a positive pid; no memory is shared.
    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(QueueError::new(ErrorCode::SignalFailed, format!("failed to signal pid {}", pid))
        .with_source(err))
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> Result<bool> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .status()
        .map_err(|e| {
            QueueError::new(ErrorCode::SignalFailed, format!("failed to signal pid {}", pid))
                .with_source(e)
        })?;
    Ok(status.success())
}
