//! Periodic scheduling error and time types

use chrono::{DateTime, Utc};

/// Result type for periodic operations
pub type Result<T> = std::result::Result<T, PeriodicError>;

/// Periodic scheduling errors
#[derive(Debug, thiserror::Error)]
pub enum PeriodicError {
    /// Cron expression rejected by the parser
    #[error("invalid cron expression `{expression}`: {message}")]
    InvalidCron {
        /// Expression as given
        expression: String,
        /// Parser message
        message: String,
    },
    /// Interval that is not a positive, finite number of seconds
    #[error("invalid period: {0}")]
    InvalidPeriod(f64),
    /// Fire time that is not a finite number of unix seconds
    #[error("invalid fire time: {0}")]
    InvalidTime(f64),
    /// Store or configuration failure
    #[error(transparent)]
    Core(#[from] crate::error::Error),
    /// The scheduler no longer accepts tasks
    #[error("scheduler stopped")]
    Stopped,
    /// Task body failure
    #[error("task failed: {0}")]
    Task(String),
}

/// Current time as fractional unix seconds
pub fn now() -> f64 {
    timestamp(Utc::now())
}

/// Fractional unix seconds of `time`
pub fn timestamp(time: DateTime<Utc>) -> f64 {
    time.timestamp() as f64 + f64::from(time.timestamp_subsec_micros()) / 1_000_000.0
}

/// Inverse of [`timestamp`]; `None` outside the representable range
pub fn datetime(at: f64) -> Option<DateTime<Utc>> {
    if !at.is_finite() {
        return None;
    }
    let secs = at.floor();
    let nanos = ((at - secs) * 1_000_000_000.0).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(secs as i64, nanos)
}
