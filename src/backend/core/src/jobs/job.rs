//! Job records and job defaults.
//!
//! - **JobId**: UUID v4 identity assigned at submission
//! - **JobStatus**: lifecycle state persisted with each record
//! - **Job**: the persisted record plus its retry/backoff transitions
//! - **JobDefaults**: the persisted `maxRetries` / `backoffBase` snapshot source

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ErrorCode, QueueError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Name of the claim marker guarding this job.
    pub fn lock_name(&self) -> String {
        self.0.to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| QueueError::invalid_payload(format!("invalid job id '{}'", s)).with_source(e))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `next_attempt` to pass
    Ready,
    /// Claimed by a worker
    Running,
    /// Retries exhausted, parked in the dead-letter queue
    InDlq,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::InDlq => "in_dlq",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "in_dlq" | "dlq" | "dead" => Ok(Self::InDlq),
            other => Err(QueueError::invalid_payload(format!("unknown job state '{}'", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Defaults
// ═══════════════════════════════════════════════════════════════════════════════

pub const MAX_RETRIES_KEY: &str = "maxRetries";
pub const BACKOFF_BASE_KEY: &str = "backoffBase";

/// Retry settings copied onto every job at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefaults {
    /// Failures tolerated before a job is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base of the exponential backoff, in seconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u64,
}

fn default_max_retries() -> u32 { 3 }
fn default_backoff_base() -> u64 { 2 }

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
        }
    }
}

impl JobDefaults {
    /// Keys accepted by [`get`](Self::get) and [`set`](Self::set).
    pub const KEYS: [&'static str; 2] = [MAX_RETRIES_KEY, BACKOFF_BASE_KEY];

    /// Read a setting by its persisted key.
    pub fn get(&self, key: &str) -> Result<u64> {
        match key {
            MAX_RETRIES_KEY => Ok(u64::from(self.max_retries)),
            BACKOFF_BASE_KEY => Ok(self.backoff_base),
            other => Err(unknown_key(other)),
        }
    }

    /// Update a setting from its textual value.
    ///
    /// `maxRetries` accepts any non-negative integer, `backoffBase` any
    /// integer of at least 1.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let raw = value.trim();
        match key {
            MAX_RETRIES_KEY => {
                self.max_retries = raw.parse::<u32>().map_err(|_| invalid_value(key, value))?;
            }
            BACKOFF_BASE_KEY => {
                let base = raw.parse::<u64>().map_err(|_| invalid_value(key, value))?;
                if base == 0 {
                    return Err(invalid_value(key, value));
                }
                self.backoff_base = base;
            }
            other => return Err(unknown_key(other)),
        }
        Ok(())
    }
}

fn unknown_key(key: &str) -> QueueError {
    QueueError::new(
        ErrorCode::InvalidConfigKey,
        format!(
            "unknown config key '{}' (expected one of: {})",
            key,
            JobDefaults::KEYS.join(", ")
        ),
    )
}

fn invalid_value(key: &str, value: &str) -> QueueError {
    QueueError::new(
        ErrorCode::InvalidConfigValue,
        format!("invalid value '{}' for {}", value, key),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// Drop sub-millisecond precision so a record equals itself after a trip
/// through the store.
fn to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(at.timestamp_millis())
        .single()
        .unwrap_or(at)
}

/// A persisted job. Timestamps carry millisecond precision, the resolution
/// they are stored with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub status: JobStatus,
    pub retries: u32,
    pub max_retries: u32,
    pub backoff_base: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub next_attempt: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// What a failed attempt did to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `ready`, not claimable before `next_attempt`
    Retry { next_attempt: DateTime<Utc> },
    /// `retries` went past `max_retries`
    Exhausted,
}

impl Job {
    /// Create a ready job with a fresh id and the given defaults snapshot.
    pub fn new(command: impl Into<String>, defaults: &JobDefaults, now: DateTime<Utc>) -> Self {
        let now = to_millis(now);
        Self {
            id: JobId::new(),
            command: command.into(),
            status: JobStatus::Ready,
            retries: 0,
            max_retries: defaults.max_retries,
            backoff_base: defaults.backoff_base,
            next_attempt: now,
            created_at: now,
        }
    }

    /// Ready and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Ready && self.next_attempt <= now
    }

    /// Delay before the attempt following failure number `retries`:
    /// `backoff_base ^ retries` seconds, saturating.
    pub fn backoff_delay(&self, retries: u32) -> chrono::Duration {
        let secs = self.backoff_base.saturating_pow(retries);
        i64::try_from(secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Count a failed attempt.
    ///
    /// Exhaustion leaves `status` untouched; the caller moves the record to
    /// the dead-letter queue.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> FailureOutcome {
        self.retries = self.retries.saturating_add(1);
        if self.retries > self.max_retries {
            return FailureOutcome::Exhausted;
        }
        let next_attempt = to_millis(
            now.checked_add_signed(self.backoff_delay(self.retries))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        self.status = JobStatus::Ready;
        self.next_attempt = next_attempt;
        FailureOutcome::Retry { next_attempt }
    }

    /// Copy of a dead-lettered job, ready to run again from scratch.
    pub fn reset_for_replay(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Ready,
            retries: 0,
            next_attempt: to_millis(now),
            ..self.clone()
        }
    }
}
