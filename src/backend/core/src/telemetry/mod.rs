//! Telemetry: structured logging for the queue engine and its workers.
//!
//! # Example
//!
//! ```rust,no_run
//! use queuectl_core::telemetry::{init_logging, LoggingConfig};
//!
//! init_logging(&LoggingConfig::default()).expect("Failed to initialize logging");
//! ```

pub mod logging;

pub use logging::{init_logging, LogFormat, LoggingConfig};
