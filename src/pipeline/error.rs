//! Error types and reporting for pipeline stages.

use std::fmt;

/// Errors raised by a stage thread.
#[derive(Debug, Clone, PartialEq)]
pub enum StationError {
    /// The stage keeps running; the current unit of work is lost.
    Recoverable(String),
    /// The stage cannot continue and shuts down.
    Fatal(String),
}

impl fmt::Display for StationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationError::Recoverable(msg) => write!(f, "Recoverable error: {}", msg),
            StationError::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl std::error::Error for StationError {}

/// Trait for reporting stage errors.
pub trait ErrorReporter: Send + Sync {
    /// Reports an error from a stage.
    fn report(&self, station: &str, error: &StationError);
}

/// Reporter that forwards to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, station: &str, error: &StationError) {
        match error {
            StationError::Recoverable(msg) => tracing::warn!(station, "{}", msg),
            StationError::Fatal(msg) => tracing::error!(station, "{}", msg),
        }
    }
}

/// Text of a thread panic payload, for logging after `join`.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
}
