//! Error handling for the queue engine.
//!
//! This module provides:
//! - A single error type carrying a stable, machine-readable code
//! - Error chaining through `std::error::Error::source`
//! - Severity-aware logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use queuectl_core::error::{QueueError, Result};
//!
//! fn lookup(id: &str) -> Result<()> {
//!     Err(QueueError::not_found("job", id))
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Store Errors (1000-1099)
    StorageIo,
    StorageCorrupted,
    SerializationError,

    // Lock Errors (1100-1199)
    LockTimeout,
    LockIo,

    // Queue Errors (1200-1299)
    JobNotFound,
    InvalidPayload,
    InvalidConfigKey,
    InvalidConfigValue,

    // Process Errors (1400-1499)
    ProcessSpawnFailed,
    SignalFailed,

    // Configuration Errors (5000-5099)
    ConfigurationError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::StorageIo => 1000,
            Self::StorageCorrupted => 1001,
            Self::SerializationError => 1002,

            Self::LockTimeout => 1100,
            Self::LockIo => 1101,

            Self::JobNotFound => 1200,
            Self::InvalidPayload => 1201,
            Self::InvalidConfigKey => 1202,
            Self::InvalidConfigValue => 1203,

            Self::ProcessSpawnFailed => 1400,
            Self::SignalFailed => 1401,

            Self::ConfigurationError => 5000,
        }
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "store",
            1100..=1199 => "lock",
            1200..=1299 => "queue",
            1400..=1499 => "process",
            5000..=5099 => "configuration",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Operator errors (bad input, unknown ids)
    Low,
    /// Operational issues (contention, timeouts)
    Medium,
    /// System errors (I/O, corrupted documents)
    High,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound
            | ErrorCode::InvalidPayload
            | ErrorCode::InvalidConfigKey
            | ErrorCode::InvalidConfigValue => Self::Low,

            ErrorCode::LockTimeout | ErrorCode::SignalFailed => Self::Medium,

            ErrorCode::StorageIo
            | ErrorCode::StorageCorrupted
            | ErrorCode::SerializationError
            | ErrorCode::LockIo
            | ErrorCode::ProcessSpawnFailed
            | ErrorCode::ConfigurationError => Self::High,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type of the queue engine.
#[derive(Error, Debug)]
pub struct QueueError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Human-readable message
    message: Cow<'static, str>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref source) = self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl QueueError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create a not found error.
    pub fn not_found(entity_type: &str, entity_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::JobNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
    }

    /// Create an invalid payload error.
    pub fn invalid_payload(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidPayload, message)
    }

    /// Wrap an I/O error that happened while touching `path`.
    pub fn io(code: ErrorCode, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::new(code, format!("I/O error on {}", path.display())).with_source(source)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the message without the code prefix.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Check if this is a lookup miss.
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::JobNotFound
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    source = ?self.source,
                    "Queue error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Queue error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Queue error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "queuectl_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::SerializationError, "JSON encoding failed").with_source(err)
    }
}

impl From<config::ConfigError> for QueueError {
    fn from(err: config::ConfigError) -> Self {
        Self::new(ErrorCode::ConfigurationError, "Failed to load configuration").with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numeric() {
        assert_eq!(ErrorCode::StorageIo.numeric_code(), 1000);
        assert_eq!(ErrorCode::JobNotFound.numeric_code(), 1200);
        assert_eq!(ErrorCode::ConfigurationError.numeric_code(), 5000);
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::LockTimeout.category(), "lock");
        assert_eq!(ErrorCode::InvalidPayload.category(), "queue");
        assert_eq!(ErrorCode::SignalFailed.category(), "process");
    }

    #[test]
    fn test_not_found_display() {
        let err = QueueError::not_found("Job", "abc-123");
        assert!(err.is_not_found());
        assert_eq!(err.severity(), ErrorSeverity::Low);
        let msg = err.to_string();
        assert!(msg.contains("JobNotFound"));
        assert!(msg.contains("abc-123"));
    }

    #[test]
    fn test_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = QueueError::io(ErrorCode::StorageIo, std::path::Path::new("/tmp/x"), io);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_from_serde_json() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("nope");
        let err: QueueError = parse.unwrap_err().into();
        assert_eq!(err.code(), ErrorCode::SerializationError);
    }
}
