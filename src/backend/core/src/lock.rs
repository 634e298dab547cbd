//! Advisory cross-process locks backed by exclusively created marker files.
//!
//! A marker `<dir>/<name>.lock` exists exactly while someone holds the lock.
//! Creation uses `create_new`, so of several processes racing for the same
//! name exactly one succeeds. The marker body records the owner pid, the
//! acquisition time and a random token:
//!
//! ```json
//! { "owner": 4242, "acquiredAt": 1717000000000, "token": "8b0c..." }
//! ```
//!
//! A marker is *stale* when its owner process is gone. Managers built with
//! [`LockManager::new`] also treat markers older than `stale_after` as stale;
//! those guard short critical sections. Managers built with
//! [`LockManager::owner_bound`] never expire a marker whose owner is alive, so
//! a long-running job is not claimed a second time.
//!
//! Stale markers are reclaimed: the marker is renamed to a private tombstone,
//! verified to still be the stale one, and only then discarded before a fresh
//! exclusive create. If the tombstone turns out to be someone else's fresh
//! marker it is linked back into place. Restoring fails when a third process
//! created a marker in the meantime; the holder of the moved marker then
//! shares the lock with that process until one of them releases. This needs
//! three processes reclaiming the same stale marker at once and is logged as
//! an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, QueueError, Result};
use crate::process;

const MARKER_EXTENSION: &str = "lock";

/// How long an undecodable marker counts as being written when the manager
/// has no age limit of its own.
const UNWRITTEN_MARKER_GRACE: Duration = Duration::from_secs(30);

/// Contents of a lock marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockMarker {
    /// Pid of the process holding the lock
    pub owner: u32,
    /// When the lock was taken
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub acquired_at: DateTime<Utc>,
    /// Distinguishes successive holders with the same pid
    pub token: Uuid,
}

impl LockMarker {
    fn fresh() -> Self {
        Self {
            owner: process::current_pid(),
            acquired_at: Utc::now(),
            token: Uuid::new_v4(),
        }
    }

    /// Whether this marker may be reclaimed at `now`. Without `max_age`
    /// only a dead owner makes it stale.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Option<Duration>) -> bool {
        if !process::is_alive(self.owner) {
            return true;
        }
        let Some(max_age) = max_age else {
            return false;
        };
        older_than(now, self.acquired_at, max_age)
    }
}

/// A held lock. Release it with [`LockManager::release`]; dropping an
/// unreleased guard removes the marker synchronously as a backstop.
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    path: PathBuf,
    token: Uuid,
    released: bool,
}

impl LockGuard {
    /// Lock name (job id or collection name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Marker file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if owned_by(&self.path, self.token) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(lock = %self.name, error = %e, "Failed to remove lock marker on drop");
                }
            }
        }
    }
}

fn older_than(now: DateTime<Utc>, then: DateTime<Utc>, limit: Duration) -> bool {
    now.signed_duration_since(then)
        .to_std()
        .map(|age| age > limit)
        .unwrap_or(false)
}

fn owned_by(path: &Path, token: Uuid) -> bool {
    std::fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LockMarker>(&bytes).ok())
        .map(|marker| marker.token == token)
        .unwrap_or(false)
}

/// Issues and releases marker-file locks inside one directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    stale_after: Option<Duration>,
}

impl LockManager {
    /// Create a manager for markers under `dir` whose markers expire once
    /// they are older than `stale_after`, even with a live owner.
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after: Some(stale_after),
        }
    }

    /// Create a manager whose markers are only reclaimed once their owner
    /// process has exited.
    pub fn owner_bound(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stale_after: None,
        }
    }

    /// Directory holding the markers.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the marker for `name`.
    pub fn marker_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, MARKER_EXTENSION))
    }

    /// Try to take the lock `name` without waiting.
    ///
    /// Returns `Ok(None)` when a live holder already has it.
    pub async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>> {
        let path = self.marker_path(name);

        if let Some(guard) = self.create_marker(name, &path).await? {
            return Ok(Some(guard));
        }

        let Some(existing) = self.read_marker(&path).await? else {
            // Vanished between our create attempt and the read; one more try.
            return self.create_marker(name, &path).await;
        };

        if !existing.is_stale(Utc::now(), self.stale_after) {
            return Ok(None);
        }

        if !self.reclaim(name, &path, &existing).await? {
            return Ok(None);
        }

        warn!(
            lock = name,
            previous_owner = existing.owner,
            acquired_at = %existing.acquired_at,
            "Reclaimed stale lock marker"
        );
        self.create_marker(name, &path).await
    }

    /// Take the lock `name`, polling until `timeout` elapses.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = Duration::from_millis(2);

        loop {
            if let Some(guard) = self.try_acquire(name).await? {
                return Ok(guard);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(QueueError::new(
                    ErrorCode::LockTimeout,
                    format!("timed out after {:?} waiting for lock '{}'", timeout, name),
                ));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(50));
        }
    }

    /// Release a held lock. A marker that is already gone, or that has been
    /// reclaimed by someone else, counts as released.
    pub async fn release(&self, mut guard: LockGuard) -> Result<()> {
        guard.released = true;

        match self.read_marker(&guard.path).await? {
            Some(marker) if marker.token == guard.token => {}
            Some(_) => {
                warn!(lock = %guard.name, "Lock marker was reclaimed by another holder");
                return Ok(());
            }
            None => return Ok(()),
        }

        match fs::remove_file(&guard.path).await {
            Ok(()) => {
                debug!(lock = %guard.name, "Released lock");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::io(ErrorCode::LockIo, &guard.path, e)),
        }
    }

    /// Whether a marker for `name` currently exists (stale or not).
    pub async fn is_locked(&self, name: &str) -> Result<bool> {
        Ok(self.read_marker(&self.marker_path(name)).await?.is_some())
    }

    /// Read the marker for `name`, if any.
    pub async fn inspect(&self, name: &str) -> Result<Option<LockMarker>> {
        self.read_marker(&self.marker_path(name)).await
    }

    async fn create_marker(&self, name: &str, path: &Path) -> Result<Option<LockGuard>> {
        let file = match self.open_exclusive(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(QueueError::io(ErrorCode::LockIo, path, e)),
        };

        let marker = LockMarker::fresh();
        let guard = LockGuard {
            name: name.to_string(),
            path: path.to_path_buf(),
            token: marker.token,
            released: false,
        };

        let body = serde_json::to_vec(&marker)?;
        let mut file = file;
        if let Err(e) = file.write_all(&body).await {
            // The guard's drop check cannot see our token; remove directly.
            let mut guard = guard;
            guard.released = true;
            let _ = fs::remove_file(path).await;
            return Err(QueueError::io(ErrorCode::LockIo, path, e));
        }
        if let Err(e) = file.sync_all().await {
            debug!(lock = name, error = %e, "fsync of lock marker failed");
        }

        debug!(lock = name, "Acquired lock");
        Ok(Some(guard))
    }

    async fn open_exclusive(&self, path: &Path) -> std::io::Result<fs::File> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        match options.open(path).await {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&self.dir).await?;
                options.open(path).await
            }
            other => other,
        }
    }

    /// Read a marker. A marker that exists but cannot be decoded yet (its
    /// creator has not finished writing it) is reported with the file's
    /// modification time and an unknown owner of `0` only once it is older
    /// than `stale_after` (or [`UNWRITTEN_MARKER_GRACE`]); before that it is
    /// treated as freshly held.
    async fn read_marker(&self, path: &Path) -> Result<Option<LockMarker>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(QueueError::io(ErrorCode::LockIo, path, e)),
        };

        if let Ok(marker) = serde_json::from_slice::<LockMarker>(&bytes) {
            return Ok(Some(marker));
        }

        let modified = fs::metadata(path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);
        let grace = self.stale_after.unwrap_or(UNWRITTEN_MARKER_GRACE);
        let old_enough = older_than(Utc::now(), modified, grace);

        Ok(Some(LockMarker {
            owner: if old_enough { 0 } else { process::current_pid() },
            acquired_at: modified,
            token: Uuid::nil(),
        }))
    }

    /// Move a stale marker out of the way. Returns `true` when the slot is
    /// free for a new exclusive create.
    async fn reclaim(&self, name: &str, path: &Path, stale: &LockMarker) -> Result<bool> {
        let tombstone = self
            .dir
            .join(format!(".{}.{}.reclaim", name, Uuid::new_v4()));

        match fs::rename(path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(QueueError::io(ErrorCode::LockIo, path, e)),
        }

        let moved = fs::read(&tombstone)
            .await
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockMarker>(&bytes).ok());

        let is_same = match &moved {
            Some(marker) => marker.token == stale.token,
            None => stale.token.is_nil(),
        };

        if is_same {
            let _ = fs::remove_file(&tombstone).await;
            return Ok(true);
        }

        // We raced another reclaimer and moved its fresh marker; put it back.
        let restored = fs::hard_link(&tombstone, path).await;
        let _ = fs::remove_file(&tombstone).await;
        if let Err(e) = restored {
            error!(
                lock = name,
                moved_owner = moved.as_ref().map(|m| m.owner),
                error = %e,
                "Could not restore a lock marker moved during reclaim; two holders may overlap"
            );
        }
        Ok(false)
    }
}
