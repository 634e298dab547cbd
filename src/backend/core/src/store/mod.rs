//! Durable Store: named collections persisted as whole JSON documents.
//!
//! Each [`Collection`] is one file under the data directory. Writes go to a
//! uniquely named temporary file in the same directory, are fsynced, and are
//! then renamed over the target, so readers only ever see a complete old or
//! complete new document.
//!
//! Read-modify-write cycles go through [`Store::update`], which holds a
//! per-collection mutex marker (see [`crate::lock`]) for the duration of the
//! cycle. This keeps a `submit` from being lost to a worker that rewrites the
//! same collection concurrently, across processes.
//!
//! ```text
//! <data_dir>/
//!   jobs.json     active jobs, insertion order
//!   dlq.json      dead-lettered jobs
//!   config.json   job defaults { maxRetries, backoffBase }
//!   pids.json     detached worker pids
//!   locks/        job claim markers and collection mutex markers
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{LockSettings, QueueConfig};
use crate::error::{ErrorCode, QueueError, Result};
use crate::jobs::{Job, JobDefaults};
use crate::lock::LockManager;

/// Directory (inside the data directory) holding every lock marker.
pub const LOCK_DIR_NAME: &str = "locks";

/// The persisted collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Active jobs (`ready` or `running`)
    Jobs,
    /// Jobs that exhausted their retries
    DeadLetter,
    /// Job defaults applied at submission
    Config,
    /// Pids of detached worker processes
    Workers,
}

impl Collection {
    /// All collections, in initialization order.
    pub const ALL: [Collection; 4] = [
        Collection::Jobs,
        Collection::DeadLetter,
        Collection::Config,
        Collection::Workers,
    ];

    /// Short name used in file and lock names.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::DeadLetter => "dlq",
            Self::Config => "config",
            Self::Workers => "pids",
        }
    }

    /// File name of the collection document.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.name())
    }

    fn mutex_name(&self) -> String {
        format!("{}.collection", self.name())
    }

    /// The document a collection holds before anything was written to it.
    fn default_document(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::Jobs | Self::DeadLetter => serde_json::to_value(Vec::<Job>::new())?,
            Self::Config => serde_json::to_value(JobDefaults::default())?,
            Self::Workers => serde_json::to_value(Vec::<u32>::new())?,
        };
        Ok(value)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// File-backed store of whole-collection documents.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    mutexes: LockManager,
    mutex_timeout: Duration,
}

impl Store {
    /// Create a store rooted at `root`. Nothing is touched on disk until the
    /// first access.
    pub fn new(root: impl Into<PathBuf>, locks: &LockSettings) -> Self {
        let root = root.into();
        let mutexes = LockManager::new(root.join(LOCK_DIR_NAME), locks.collection_stale_after);
        Self {
            root,
            mutexes,
            mutex_timeout: locks.collection_timeout,
        }
    }

    /// Open the store described by `config`, creating the data directory and
    /// initializing every collection that does not exist yet.
    pub async fn open(config: &QueueConfig) -> Result<Self> {
        let store = Self::new(&config.data_dir, &config.lock);
        store.initialize().await?;
        Ok(store)
    }

    /// Create directories and default documents for missing collections.
    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(self.root.join(LOCK_DIR_NAME))
            .await
            .map_err(|e| QueueError::io(ErrorCode::StorageIo, &self.root, e))?;
        for collection in Collection::ALL {
            self.ensure_initialized(collection).await?;
        }
        Ok(())
    }

    /// Root data directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding lock markers.
    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(LOCK_DIR_NAME)
    }

    /// Path of a collection document.
    pub fn path(&self, collection: Collection) -> PathBuf {
        self.root.join(collection.file_name())
    }

    /// Read a collection. A collection that was never written is initialized
    /// with its default document first; an empty file reads as the default.
    pub async fn read<T>(&self, collection: Collection) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.path(collection);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.ensure_initialized(collection).await?;
                return self.read_existing(collection).await;
            }
            Err(e) => return Err(QueueError::io(ErrorCode::StorageIo, &path, e)),
        };
        decode(collection, &bytes)
    }

    /// Persist a whole collection atomically.
    pub async fn write<T>(&self, collection: Collection, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec_pretty(value)?;
        let path = self.path(collection);
        let tmp = self.temp_path(collection);

        if let Err(e) = self.write_temp(&tmp, &body).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(QueueError::io(ErrorCode::StorageIo, &tmp, e));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(QueueError::io(ErrorCode::StorageIo, &path, e));
        }

        debug!(collection = %collection, bytes = body.len(), "Wrote collection");
        Ok(())
    }

    /// Read-modify-write a collection under its cross-process mutex.
    ///
    /// `f` always sees the current on-disk document. Whatever `f` returns is
    /// handed back after the document has been persisted.
    pub async fn update<T, R, F>(&self, collection: Collection, f: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> R,
    {
        let guard = self
            .mutexes
            .acquire(&collection.mutex_name(), self.mutex_timeout)
            .await?;

        let result = async {
            let mut document: T = self.read(collection).await?;
            let output = f(&mut document);
            self.write(collection, &document).await?;
            Ok(output)
        }
        .await;

        if let Err(e) = self.mutexes.release(guard).await {
            warn!(collection = %collection, error = %e, "Failed to release collection mutex");
        }
        result
    }

    async fn read_existing<T>(&self, collection: Collection) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.path(collection);
        let bytes = fs::read(&path)
            .await
            .map_err(|e| QueueError::io(ErrorCode::StorageIo, &path, e))?;
        decode(collection, &bytes)
    }

    /// Create the default document unless the file already exists.
    ///
    /// The default is written to a temporary file and hard-linked into
    /// place, which fails instead of clobbering a document another process
    /// wrote in the meantime.
    async fn ensure_initialized(&self, collection: Collection) -> Result<()> {
        let path = self.path(collection);
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| QueueError::io(ErrorCode::StorageIo, &self.root, e))?;

        let body = serde_json::to_vec_pretty(&collection.default_document()?)?;
        let tmp = self.temp_path(collection);
        if let Err(e) = self.write_temp(&tmp, &body).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(QueueError::io(ErrorCode::StorageIo, &tmp, e));
        }

        let linked = fs::hard_link(&tmp, &path).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => {
                debug!(collection = %collection, "Initialized collection");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(QueueError::io(ErrorCode::StorageIo, &path, e)),
        }
    }

    fn temp_path(&self, collection: Collection) -> PathBuf {
        self.root
            .join(format!(".{}.{}.tmp", collection.file_name(), Uuid::new_v4()))
    }

    async fn write_temp(&self, tmp: &Path, body: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(tmp).await?;
        file.write_all(body).await?;
        file.sync_all().await?;
        Ok(())
    }
}

fn decode<T>(collection: Collection, bytes: &[u8]) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes).map_err(|e| {
        QueueError::new(
            ErrorCode::StorageCorrupted,
            format!("collection '{}' is not a valid document", collection),
        )
        .with_source(e)
    })
}
